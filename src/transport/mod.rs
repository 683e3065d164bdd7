// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport endpoints (§4.B): the writer/receiver pair built on top of
//! the shared-memory ring (§4.A) and the channel registry (§4.C).

pub mod qos;
pub mod receiver;
pub mod writer;

pub use qos::{Qos, Reliability};
pub use receiver::Receiver;
pub use writer::Writer;
