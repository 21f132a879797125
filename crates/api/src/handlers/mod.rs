pub mod locks;
pub mod realtime;
