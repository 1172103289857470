pub mod api;
pub mod auth;
pub mod background;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod middleware;
pub mod server;
pub mod state;
pub mod validator;

#[cfg(test)]
pub mod testing;
