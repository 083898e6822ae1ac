pub mod catalog;
pub mod core;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
