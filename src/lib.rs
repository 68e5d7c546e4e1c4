pub mod cli;
pub mod config;
pub mod smtp;

pub use config::SendEmailRequest;
pub use smtp::{send_email, SendEmailError, SendEmailResult, SendOutcome, SendStatus};
