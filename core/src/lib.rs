pub mod conf;
pub mod error;
pub mod esri;
pub mod geocode;
pub mod http;
pub mod lease;
pub mod s3;
pub mod sparql;
pub mod store;
pub mod sync;
pub mod time_convert;
