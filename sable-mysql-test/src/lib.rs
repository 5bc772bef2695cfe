//! Test harness for the driver
//!
//! [server] is a scripted in-process server speaking enough of the wire
//! protocol to exercise the real client over real sockets, without needing a
//! database. The tests configure it per scenario with a statement handler.
pub mod server;

#[cfg(test)]
mod test;
