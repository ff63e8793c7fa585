// SQLite backing store - a `SqlConnection` driver on top of rusqlite
//
// - params: conversion from row values to SQLite values
// - query: result extraction and building
// - connection: the driver and its factory

pub mod connection;
pub mod params;
pub mod query;

pub use connection::{SqliteConnection, SqliteFactory};
pub use params::Params as SqliteParams;
pub use query::build_result_set;
