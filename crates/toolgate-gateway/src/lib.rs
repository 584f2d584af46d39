//! The seam external adapters call into: list tools, call a tool, and a few admin
//! operations over the persisted registry.

pub mod descriptor;
pub mod error;
pub mod gateway;

pub use descriptor::{ToolAnnotations, ToolDescriptor, input_schema};
pub use error::GatewayError;
pub use gateway::Gateway;
