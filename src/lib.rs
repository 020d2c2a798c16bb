// Pagecast Library
// Web page to multi-destination RTMP broadcaster

pub mod models;
pub mod services;
