pub mod analytics;
pub mod auth;
pub mod health;
pub mod rooms;
pub mod servers;
