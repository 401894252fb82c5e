// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Driver for the BitForce (BFL) family of serial-attached SHA256 hashing
//! appliances: line transport, wire protocol codec, per-device session
//! state, discovery, the scan engine, auxiliary ops (temperature/LED), and
//! the small surface a host scheduler drives all of it through.

pub mod aux;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod test_utils;
pub mod transport;
pub mod work;

pub use error::{Error, ErrorKind, Result};
pub use host::{Backend, EventReporter, NonceSink, Stats};
pub use session::DeviceSession;
pub use transport::{SerialTransport, Transport};
pub use work::{NeverStale, StaleCheck, Work};
