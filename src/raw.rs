//! CAN_RAW transport: per-frame I/O with kernel-side receive filters.

use std::io;
use std::time::{Duration, Instant};

use embedded_can::{Frame as EmbeddedFrame, Id};
use socketcan::{CanDataFrame, CanFilter, CanSocket, Socket, SocketOptions};
use tracing::debug;

use crate::errors::CanError;
use crate::frame::CanFrame;

/// A Linux SocketCAN interface speaking the RAW protocol.
///
/// Every matching frame on the bus is delivered individually; reception can
/// be narrowed with kernel-side id filters.
#[derive(Debug)]
pub struct RawInterface {
    socket: CanSocket,
    interface: String,
}

impl RawInterface {
    /// Open a RAW CAN socket bound to `interface` (e.g. `"can0"`, `"vcan0"`).
    pub fn open(interface: &str) -> Result<Self, CanError> {
        let socket = CanSocket::open(interface).map_err(|err| {
            CanError::Io(io::Error::new(
                err.kind(),
                format!("could not open CAN interface {interface}: {err}"),
            ))
        })?;
        debug!(interface, "opened CAN_RAW socket");
        Ok(RawInterface {
            socket,
            interface: interface.to_string(),
        })
    }

    /// Name of the bound network interface.
    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// Install kernel receive filters so that only `ids` are delivered.
    ///
    /// One exact-match filter is installed per id; the mask includes the
    /// frame-format flag so a standard id never matches an extended frame
    /// with the same number. An empty list installs a filter that blocks
    /// everything (useful when this node produces every known frame).
    /// Re-applying the same set is idempotent.
    pub fn set_receive_filters(&self, ids: &[Id]) -> Result<(), CanError> {
        if ids.is_empty() {
            debug!(interface = %self.interface, "installing drop-all receive filter");
            self.socket.set_filter_drop_all()?;
            return Ok(());
        }
        let filters: Vec<CanFilter> = ids
            .iter()
            .map(|id| {
                let (id_word, mask) = exact_filter_parts(*id);
                CanFilter::new(id_word, mask)
            })
            .collect();
        debug!(interface = %self.interface, count = filters.len(), "installing receive filters");
        self.socket.set_filters(filters.as_slice())?;
        Ok(())
    }

    /// Send a single frame.
    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        let wire = <socketcan::CanFrame as EmbeddedFrame>::new(frame.id(), frame.data())
            .ok_or_else(|| {
                CanError::Config(format!("frame {:?} cannot be sent on the wire", frame.id()))
            })?;
        self.socket.write_frame(&wire)?;
        Ok(())
    }

    /// Receive the next data frame, blocking up to `timeout` (`None` blocks
    /// indefinitely). Remote request frames are skipped; error frames surface
    /// as I/O failures.
    pub fn recv_next_frame(&self, timeout: Option<Duration>) -> Result<CanFrame, CanError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let frame = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CanError::Timeout);
                    }
                    match self.socket.read_frame_timeout(deadline - now) {
                        Ok(frame) => frame,
                        Err(err)
                            if matches!(
                                err.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) =>
                        {
                            return Err(CanError::Timeout);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                None => self.socket.read_frame()?,
            };
            match frame {
                socketcan::CanFrame::Data(data) => return convert_data_frame(&data),
                // Remote requests carry no data and are out of scope.
                socketcan::CanFrame::Remote(_) => continue,
                socketcan::CanFrame::Error(err) => {
                    return Err(CanError::Io(io::Error::other(format!(
                        "CAN error frame received: {:?}",
                        err.into_error()
                    ))));
                }
            }
        }
    }
}

fn convert_data_frame(frame: &CanDataFrame) -> Result<CanFrame, CanError> {
    CanFrame::with_data(frame.id(), frame.data())
}

/// Id word and mask for an exact-match kernel filter.
///
/// Raw filters match `received_id & mask == filter_id & mask` where ids
/// include the EFF/RTR/ERR flag bits, so the EFF flag goes into the mask to
/// pin the frame format.
fn exact_filter_parts(id: Id) -> (u32, u32) {
    match id {
        Id::Standard(id) => (id.as_raw() as u32, libc::CAN_SFF_MASK | libc::CAN_EFF_FLAG),
        Id::Extended(id) => (
            id.as_raw() | libc::CAN_EFF_FLAG,
            libc::CAN_EFF_MASK | libc::CAN_EFF_FLAG,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::{ExtendedId, StandardId};

    #[test]
    fn standard_filter_pins_the_frame_format() {
        let id = Id::Standard(StandardId::new(0x123).unwrap());
        let (id_word, mask) = exact_filter_parts(id);
        assert_eq!(id_word, 0x123);
        assert_eq!(mask, 0x7FF | 0x8000_0000);
    }

    #[test]
    fn extended_filter_carries_the_eff_flag() {
        let id = Id::Extended(ExtendedId::new(0x1ABC_DEF0).unwrap());
        let (id_word, mask) = exact_filter_parts(id);
        assert_eq!(id_word, 0x1ABC_DEF0 | 0x8000_0000);
        assert_eq!(mask, 0x1FFF_FFFF | 0x8000_0000);
    }
}
