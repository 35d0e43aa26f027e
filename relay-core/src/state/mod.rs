pub mod connection;

pub use connection::LinkPhase;
