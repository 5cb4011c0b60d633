//! Server composition - request handling, lifecycle and client transport

pub mod communicator;
pub mod controller;
pub mod request;

pub use communicator::{ChannelCommunicator, LoggingCommunicator};
pub use controller::{ApplicationController, ControllerBuilder};
pub use request::{ClientRequest, Inbound, Reply, RequestKind};
