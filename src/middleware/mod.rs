pub mod admin;
pub mod rate_limit;
pub mod tenant;
