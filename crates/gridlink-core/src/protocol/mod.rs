//! Serialosc protocol model: message values, address constants, and reply
//! parsers.  Wire encoding lives behind the transport seam, not here.

pub mod messages;
