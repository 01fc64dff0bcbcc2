//! CAN_BCM transport: kernel-side periodic transmission and change-filtered
//! reception via the SocketCAN Broadcast Manager.
//!
//! BCM sockets are message oriented. Every message is a fixed
//! [`bcm_msg_head`](https://www.kernel.org/doc/html/latest/networking/can.html#broadcast-manager-protocol-sockets-sock-dgram)
//! followed by `nframes` classic CAN frames. The head contains two
//! `long`-based timevals, so its layout depends on the platform data model;
//! the struct below reproduces the kernel layout through `#[repr(C)]` plus an
//! 8-byte end alignment, and the layout is pinned by compile-time assertions
//! and unit tests. All fields are native byte order and are never swapped.

use std::collections::VecDeque;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, RawFd};
use std::slice;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use embedded_can::Id;
use socket2::{Domain, Protocol, Socket, Type};
use socketcan::CanAddr;
use tracing::debug;

use crate::codec::PAYLOAD_BYTES;
use crate::errors::CanError;
use crate::frame::{self, CanFrame, WIRE_FRAME_LEN};

// Broadcast manager opcodes, from linux/can/bcm.h.
const TX_SETUP: u32 = 1;
const TX_DELETE: u32 = 2;
const TX_SEND: u32 = 4;
const RX_SETUP: u32 = 7;
const RX_DELETE: u32 = 8;
const RX_CHANGED: u32 = 12;

bitflags! {
    /// Flags of the BCM message head, from linux/can/bcm.h.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BcmFlags: u32 {
        const SETTIMER            = 0x0001;
        const STARTTIMER          = 0x0002;
        const TX_COUNTEVT         = 0x0004;
        const TX_ANNOUNCE         = 0x0008;
        const TX_CP_CAN_ID        = 0x0010;
        const RX_FILTER_ID        = 0x0020;
        const RX_CHECK_DLC        = 0x0040;
        const RX_NO_AUTOTIMER     = 0x0080;
        const RX_ANNOUNCE_RESUME  = 0x0100;
        const TX_RESET_MULTI_IDX  = 0x0200;
        const RX_RTR_FRAME        = 0x0400;
    }
}

/// `struct bcm_timeval`: seconds/microseconds as platform `long`s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct BcmTimeval {
    tv_sec: libc::c_long,
    tv_usec: libc::c_long,
}

impl BcmTimeval {
    fn from_millis(millis: u64) -> Self {
        BcmTimeval {
            tv_sec: (millis / 1000) as libc::c_long,
            tv_usec: ((millis % 1000) * 1000) as libc::c_long,
        }
    }
}

/// `struct bcm_msg_head`.
///
/// The trailing CAN frames must start 8-byte aligned (the kernel's
/// `can_frame` carries an aligned 8-byte data field), so the head is forced
/// to 8-byte alignment; on 64-bit targets this changes nothing, on 32-bit
/// targets it adds the required trailing pad.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
struct BcmMsgHead {
    opcode: u32,
    flags: u32,
    /// Number of `ival1` repetitions before switching to `ival2`.
    count: u32,
    ival1: BcmTimeval,
    ival2: BcmTimeval,
    can_id: u32,
    nframes: u32,
}

// The head must end 8-byte aligned because CAN frames follow directly.
const _: () = assert!(size_of::<BcmMsgHead>() % 8 == 0);
#[cfg(target_pointer_width = "64")]
const _: () = assert!(size_of::<BcmMsgHead>() == 56);

const BCM_HEAD_LEN: usize = size_of::<BcmMsgHead>();
/// Largest BCM message we accept from the kernel in one read.
const BCM_RECV_LEN: usize = 1024;

/// Receive buffer with the alignment the head requires.
#[repr(C, align(8))]
struct RecvBuffer([u8; BCM_RECV_LEN]);

impl BcmMsgHead {
    fn as_bytes(&self) -> &[u8] {
        // Plain-old-data view of the head for writing to the socket.
        unsafe { slice::from_raw_parts((self as *const BcmMsgHead).cast::<u8>(), BCM_HEAD_LEN) }
    }
}

/// A Linux SocketCAN interface speaking the Broadcast Manager protocol.
///
/// Periodic transmission and receive-side change detection run inside the
/// kernel; this type only assembles and parses BCM messages.
#[derive(Debug)]
pub struct BcmInterface {
    socket: Socket,
    interface: String,
    /// Frames parsed from a BCM message but not yet handed to the caller
    /// (a message may carry several).
    pending: VecDeque<CanFrame>,
}

impl BcmInterface {
    /// Open a BCM socket connected to `interface` (e.g. `"can0"`, `"vcan0"`).
    pub fn open(interface: &str) -> Result<Self, CanError> {
        let addr = CanAddr::from_iface(interface).map_err(|err| {
            CanError::Io(io::Error::new(
                err.kind(),
                format!("could not resolve CAN interface {interface}: {err}"),
            ))
        })?;
        let socket = Socket::new(
            Domain::from(libc::AF_CAN),
            Type::DGRAM,
            Some(Protocol::from(libc::CAN_BCM)),
        )?;
        socket.connect(&addr.into_sock_addr())?;
        debug!(interface, "opened CAN_BCM socket");
        Ok(BcmInterface {
            socket,
            interface: interface.to_string(),
            pending: VecDeque::new(),
        })
    }

    /// Name of the connected network interface.
    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// Send a single frame once (TX_SEND).
    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        let message = build_message(
            TX_SEND,
            BcmFlags::empty(),
            0,
            None,
            frame::canid(frame.id()),
            slice::from_ref(frame),
        );
        self.send_message(&message, frame.id())
    }

    /// Start, restart or update kernel-side periodic transmission (TX_SETUP).
    ///
    /// With `interval_ms` set, the cycle timer is programmed (`ival2`; the
    /// `count`/`ival1` stage is unused) and SETTIMER is raised. With
    /// `restart_timer`, STARTTIMER (re)starts the cycle. Calling with
    /// `interval_ms = None` and `restart_timer = false` updates only the
    /// payload: the running timer is untouched and the kernel continues
    /// cycling with the new data.
    pub fn setup_periodic_send(
        &self,
        frame: &CanFrame,
        interval_ms: Option<u32>,
        restart_timer: bool,
    ) -> Result<(), CanError> {
        let mut flags = BcmFlags::empty();
        if interval_ms.is_some() {
            flags |= BcmFlags::SETTIMER;
        }
        if restart_timer {
            flags |= BcmFlags::STARTTIMER;
        }
        let message = build_message(
            TX_SETUP,
            flags,
            0,
            interval_ms,
            frame::canid(frame.id()),
            slice::from_ref(frame),
        );
        self.send_message(&message, frame.id())
    }

    /// Stop periodic transmission for a frame id (TX_DELETE).
    pub fn stop_periodic_send(&self, id: Id) -> Result<(), CanError> {
        let message = build_message(TX_DELETE, BcmFlags::empty(), 0, None, frame::canid(id), &[]);
        self.send_message(&message, id)
    }

    /// Subscribe to a frame id (RX_SETUP).
    ///
    /// Without a `change_mask` the RX_FILTER_ID flag is used and every frame
    /// with this id is delivered. With a mask, only changes under the mask
    /// bits trigger delivery (plus DLC changes, RX_CHECK_DLC). A positive
    /// `throttle_ms` rate-limits delivery via `ival2`.
    pub fn setup_reception(
        &self,
        id: Id,
        throttle_ms: Option<u32>,
        change_mask: Option<[u8; PAYLOAD_BYTES]>,
    ) -> Result<(), CanError> {
        let mut flags = BcmFlags::empty();
        if throttle_ms.is_some_and(|ms| ms > 0) {
            flags |= BcmFlags::SETTIMER;
        }
        let masking_frame = match change_mask {
            Some(mask) => {
                flags |= BcmFlags::RX_CHECK_DLC;
                CanFrame::with_data(id, &mask)?
            }
            None => {
                flags |= BcmFlags::RX_FILTER_ID;
                CanFrame::new(id, PAYLOAD_BYTES as u8)?
            }
        };
        let message = build_message(
            RX_SETUP,
            flags,
            0,
            throttle_ms,
            frame::canid(id),
            slice::from_ref(&masking_frame),
        );
        self.send_message(&message, id)
    }

    /// Unsubscribe from a frame id (RX_DELETE).
    pub fn stop_reception(&self, id: Id) -> Result<(), CanError> {
        let message = build_message(RX_DELETE, BcmFlags::empty(), 0, None, frame::canid(id), &[]);
        self.send_message(&message, id)
    }

    /// Receive the next frame delivered by the broadcast manager, blocking up
    /// to `timeout` (`None` blocks indefinitely).
    ///
    /// A BCM message may carry several frames; they are yielded one at a
    /// time in message order.
    pub fn recv_next_frame(&mut self, timeout: Option<Duration>) -> Result<CanFrame, CanError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CanError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !poll_readable(self.socket.as_raw_fd(), remaining)? {
                return Err(CanError::Timeout);
            }
            self.read_message()?;
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
        }
    }

    /// Read one BCM message and queue its frames.
    fn read_message(&mut self) -> Result<(), CanError> {
        let mut buffer = RecvBuffer([0; BCM_RECV_LEN]);
        let count = unsafe {
            libc::read(
                self.socket.as_raw_fd(),
                buffer.0.as_mut_ptr().cast(),
                BCM_RECV_LEN,
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let count = count as usize;
        if count < BCM_HEAD_LEN {
            return Err(CanError::Io(io::Error::other(format!(
                "short BCM message: {count} bytes"
            ))));
        }
        // The buffer is 8-byte aligned and at least head-sized.
        let head = unsafe { &*buffer.0.as_ptr().cast::<BcmMsgHead>() };
        if head.opcode != RX_CHANGED {
            return Err(CanError::Io(io::Error::other(format!(
                "unexpected BCM opcode {} for can id {:#x}",
                head.opcode, head.can_id
            ))));
        }
        let nframes = head.nframes as usize;
        if count < BCM_HEAD_LEN + nframes * WIRE_FRAME_LEN {
            return Err(CanError::Io(io::Error::other(format!(
                "truncated BCM message: {count} bytes for {nframes} frames"
            ))));
        }
        for index in 0..nframes {
            let offset = BCM_HEAD_LEN + index * WIRE_FRAME_LEN;
            let frame = CanFrame::from_wire(&buffer.0[offset..offset + WIRE_FRAME_LEN])?;
            self.pending.push_back(frame);
        }
        Ok(())
    }

    fn send_message(&self, message: &[u8], id: Id) -> Result<(), CanError> {
        match self.socket.send(message) {
            Ok(sent) if sent == message.len() => Ok(()),
            Ok(sent) => Err(CanError::Io(io::Error::other(format!(
                "short BCM write: {sent} of {} bytes",
                message.len()
            )))),
            // EINVAL: the kernel has no entry for this frame id.
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                Err(CanError::NotFoundByKernel(frame::raw_id(id)))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Assemble a BCM message: head (with `ival2` from `interval_ms`) plus
/// trailing wire frames.
fn build_message(
    opcode: u32,
    flags: BcmFlags,
    count: u32,
    interval_ms: Option<u32>,
    can_id: u32,
    frames: &[CanFrame],
) -> Vec<u8> {
    let head = BcmMsgHead {
        opcode,
        flags: flags.bits(),
        count,
        ival1: BcmTimeval::default(),
        ival2: BcmTimeval::from_millis(u64::from(interval_ms.unwrap_or(0))),
        can_id,
        nframes: frames.len() as u32,
    };
    let mut message = Vec::with_capacity(BCM_HEAD_LEN + frames.len() * WIRE_FRAME_LEN);
    message.extend_from_slice(head.as_bytes());
    for frame in frames {
        message.extend_from_slice(&frame.to_wire());
    }
    message
}

fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool, CanError> {
    let timeout_ms = match timeout {
        None => -1,
        Some(timeout) => i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1),
    };
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let res = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if res > 0 {
            return Ok(true);
        }
        if res == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err.into());
    }
}
