pub mod config;
pub mod confluence;
pub mod db;
pub mod notes;
pub mod region;
pub mod sync;
