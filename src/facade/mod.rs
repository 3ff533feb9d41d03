mod database;
mod transactions;

pub use database::Database;
