pub mod traits;
pub mod types;
pub mod webhook;

pub use traits::Responder;
pub use types::{GatewayError, ResponderRequest};
pub use webhook::WebhookResponder;
