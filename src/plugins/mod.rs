// Plugin infrastructure for converge

pub mod callbacks;

pub use callbacks::{create_callback_plugin, CallbackManager, CallbackPlugin};
