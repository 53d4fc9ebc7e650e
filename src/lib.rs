pub mod clippings;
pub mod config;
pub mod csv_export;
pub mod group;
pub mod markdown;
pub mod models;
pub mod normalize;
pub mod store;
pub mod sync;
