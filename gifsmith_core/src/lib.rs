extern crate custom_error;

pub mod models;
