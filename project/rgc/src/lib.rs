pub mod api;
pub mod cli;
pub mod controllers;
pub mod protocol;
