//! Protocol module for tenantdb-gateway
//!
//! Only the PostgreSQL v3 wire protocol is spoken: the client side is a
//! stock driver, and the engine side is a PostgreSQL server reached over a
//! private socket.

pub mod postgres;
