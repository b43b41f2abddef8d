pub mod request;
pub mod resources;
pub mod seed;
