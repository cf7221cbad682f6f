// network/dpi/mod.rs - Payload inspection used by the tap
pub mod tls;
