pub extern crate chrono;
pub extern crate serde;
pub extern crate serde_json;

mod admission;
mod message;
mod registry;

pub use admission::{AdmissionController, AdmissionState, Notification, Recipient, Transition};
pub use message::*;
pub use registry::{Connection, ConnectionRegistry, Departure, SessionRoom};
