//! Command surface: typed requests, their raw encoding, and dispatch.
//!
//! Raw commands carry little-endian payloads of 8-byte words. A payload
//! that cannot be decoded is reported as [`FiberError::InvalidPayload`],
//! never as a logic failure.

use crate::error::{FiberError, Result};
use crate::fiber::FiberId;
use crate::space::{CreateParams, FiberEntry, FiberSpace};
use std::ffi::c_void;

pub const CMD_TO_FIBER: u32 = 0;
pub const CMD_CREATE: u32 = 1;
pub const CMD_SWITCH: u32 = 2;
pub const CMD_FLS_ALLOC: u32 = 3;
pub const CMD_FLS_FREE: u32 = 4;
pub const CMD_FLS_SET: u32 = 5;
pub const CMD_FLS_GET: u32 = 6;

/// Creation parameters as they arrive on the wire: three words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCreateParams {
    pub stack: u64,
    pub entry_point: u64,
    pub param: u64,
}

impl RawCreateParams {
    /// Reinterpret the words as creation parameters.
    ///
    /// # Safety
    /// A non-zero `entry_point` must be the address of a function with the
    /// [`FiberEntry`] signature.
    pub unsafe fn into_params(self) -> Result<CreateParams> {
        if self.entry_point == 0 {
            return Err(FiberError::InvalidParams("entry point is null"));
        }
        let entry_point =
            unsafe { std::mem::transmute::<usize, FiberEntry>(self.entry_point as usize) };
        Ok(CreateParams {
            stack: self.stack as usize as *mut u8,
            entry_point,
            param: self.param as usize as *mut c_void,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ToFiber,
    Create(RawCreateParams),
    Switch(FiberId),
    FlsAlloc,
    FlsFree(i64),
    FlsSet { index: i64, value: u64 },
    FlsGet(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Fiber(FiberId),
    Slot(usize),
    Value(u64),
    Done,
}

struct Words<'a> {
    command: u32,
    payload: &'a [u8],
}

impl Words<'_> {
    fn word(&self, n: usize) -> Result<u64> {
        let start = n * 8;
        self.payload
            .get(start..start + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| {
                tracing::warn!(command = self.command, len = self.payload.len(), "short payload");
                FiberError::InvalidPayload {
                    command: self.command,
                    reason: "payload too short",
                }
            })
    }
}

impl Request {
    /// Decode a raw command and its payload.
    pub fn decode(command: u32, payload: &[u8]) -> Result<Request> {
        let words = Words { command, payload };
        let request = match command {
            CMD_TO_FIBER => Request::ToFiber,
            CMD_CREATE => Request::Create(RawCreateParams {
                stack: words.word(0)?,
                entry_point: words.word(1)?,
                param: words.word(2)?,
            }),
            CMD_SWITCH => Request::Switch(FiberId(words.word(0)?)),
            CMD_FLS_ALLOC => Request::FlsAlloc,
            CMD_FLS_FREE => Request::FlsFree(words.word(0)? as i64),
            CMD_FLS_SET => Request::FlsSet {
                index: words.word(0)? as i64,
                value: words.word(1)?,
            },
            CMD_FLS_GET => Request::FlsGet(words.word(0)? as i64),
            _ => {
                tracing::warn!(command, "unknown command");
                return Err(FiberError::InvalidPayload {
                    command,
                    reason: "unknown command",
                });
            }
        };
        Ok(request)
    }

    /// Command number of this request.
    pub fn command(&self) -> u32 {
        match self {
            Request::ToFiber => CMD_TO_FIBER,
            Request::Create(_) => CMD_CREATE,
            Request::Switch(_) => CMD_SWITCH,
            Request::FlsAlloc => CMD_FLS_ALLOC,
            Request::FlsFree(_) => CMD_FLS_FREE,
            Request::FlsSet { .. } => CMD_FLS_SET,
            Request::FlsGet(_) => CMD_FLS_GET,
        }
    }

    /// Command number and payload of this request.
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let words: Vec<u64> = match *self {
            Request::ToFiber | Request::FlsAlloc => Vec::new(),
            Request::Create(raw) => vec![raw.stack, raw.entry_point, raw.param],
            Request::Switch(id) => vec![id.0],
            Request::FlsFree(index) | Request::FlsGet(index) => vec![index as u64],
            Request::FlsSet { index, value } => vec![index as u64, value],
        };
        (
            self.command(),
            words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        )
    }
}

impl FiberSpace {
    /// Execute a request that does not carry raw addresses.
    ///
    /// `Create` is refused here with [`FiberError::InvalidParams`]; it goes
    /// through [`FiberSpace::handle_raw`].
    pub fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::ToFiber => self.convert_current().map(Response::Fiber),
            Request::Create(_) => Err(FiberError::InvalidParams(
                "create requires handle_raw",
            )),
            Request::Switch(id) => self.switch_to(id).map(|()| Response::Done),
            Request::FlsAlloc => self.fls_alloc().map(Response::Slot),
            Request::FlsFree(index) => self.fls_free(index).map(|()| Response::Done),
            Request::FlsSet { index, value } => {
                self.fls_set(index, value).map(|()| Response::Done)
            }
            Request::FlsGet(index) => self.fls_get(index).map(Response::Value),
        }
    }

    /// Execute any request, including `Create`.
    ///
    /// # Safety
    /// For `Create`, the raw stack and entry point must satisfy the
    /// contracts of [`FiberSpace::create`] and [`RawCreateParams::into_params`].
    pub unsafe fn handle_raw(&self, request: Request) -> Result<Response> {
        match request {
            Request::Create(raw) => {
                let params = unsafe { raw.into_params()? };
                unsafe { self.create(params) }.map(Response::Fiber)
            }
            other => self.handle(other),
        }
    }

    /// Decode and execute a raw command.
    ///
    /// # Safety
    /// See [`FiberSpace::handle_raw`].
    pub unsafe fn dispatch(&self, command: u32, payload: &[u8]) -> Result<Response> {
        let request = Request::decode(command, payload)?;
        unsafe { self.handle_raw(request) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fiber::FiberState;
    use std::thread;

    extern "C" fn parked(_: *mut c_void) {}

    #[test]
    fn decode_reads_little_endian_words() {
        let mut payload = 7i64.to_le_bytes().to_vec();
        payload.extend_from_slice(&0x1122u64.to_le_bytes());
        assert_eq!(
            Request::decode(CMD_FLS_SET, &payload),
            Ok(Request::FlsSet {
                index: 7,
                value: 0x1122
            })
        );
        assert_eq!(
            Request::decode(CMD_SWITCH, &3u64.to_le_bytes()),
            Ok(Request::Switch(FiberId(3)))
        );
        assert_eq!(Request::decode(CMD_FLS_ALLOC, &[]), Ok(Request::FlsAlloc));
    }

    #[test]
    fn short_payload_is_a_payload_error() {
        let err = Request::decode(CMD_FLS_SET, &[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            FiberError::InvalidPayload {
                command: CMD_FLS_SET,
                reason: "payload too short"
            }
        );
        assert_eq!(err.kind(), ErrorKind::Precondition);

        let err = Request::decode(CMD_CREATE, &[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            Request::decode(42, &[]),
            Err(FiberError::InvalidPayload { command: 42, .. })
        ));
    }

    #[test]
    fn encode_matches_decode() {
        let requests = [
            Request::ToFiber,
            Request::Switch(FiberId(9)),
            Request::FlsFree(-1),
            Request::FlsGet(2),
            Request::FlsSet { index: 1, value: 5 },
            Request::Create(RawCreateParams {
                stack: 0x1000,
                entry_point: 0x2000,
                param: 3,
            }),
        ];
        for request in requests {
            let (command, payload) = request.encode();
            assert_eq!(Request::decode(command, &payload), Ok(request));
        }
    }

    #[test]
    fn fls_commands_through_dispatch() {
        let space = FiberSpace::with_config(crate::FiberConfig::default().with_fls_capacity(2));
        let Response::Slot(slot) = space.handle(Request::FlsAlloc).unwrap() else {
            panic!("expected a slot");
        };
        let index = slot as i64;
        assert_eq!(
            space.handle(Request::FlsSet { index, value: 77 }),
            Ok(Response::Done)
        );
        let (command, payload) = Request::FlsGet(index).encode();
        assert_eq!(
            unsafe { space.dispatch(command, &payload) },
            Ok(Response::Value(77))
        );
        assert_eq!(space.handle(Request::FlsFree(index)), Ok(Response::Done));
        assert_eq!(
            space.handle(Request::FlsGet(index)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn create_through_raw_dispatch() {
        let space = FiberSpace::new();
        let mut stack = space.alloc_stack();
        let request = Request::Create(RawCreateParams {
            stack: stack.top() as u64,
            entry_point: parked as usize as u64,
            param: 0,
        });
        assert_eq!(
            space.handle(request).unwrap_err().kind(),
            ErrorKind::Precondition
        );

        let Response::Fiber(id) = (unsafe { space.handle_raw(request) }).unwrap() else {
            panic!("expected a fiber");
        };
        let stats = space.stats(id).unwrap();
        assert_eq!(stats.state, FiberState::Stopped);
        assert_eq!(stats.entry_point, parked as usize);
    }

    #[test]
    fn create_with_null_entry_fails() {
        let space = FiberSpace::new();
        let request = Request::Create(RawCreateParams {
            stack: 0x10000,
            entry_point: 0,
            param: 0,
        });
        assert_eq!(
            unsafe { space.handle_raw(request) },
            Err(FiberError::InvalidParams("entry point is null"))
        );
        assert!(space.is_empty());
    }

    #[test]
    fn to_fiber_then_switch_to_missing() {
        thread::spawn(|| {
            let space = FiberSpace::new();
            let Response::Fiber(id) = space.handle(Request::ToFiber).unwrap() else {
                panic!("expected a fiber");
            };
            assert_eq!(id, FiberId(0));
            assert_eq!(
                space.handle(Request::Switch(FiberId(5))),
                Err(FiberError::NotFound(FiberId(5)))
            );
        })
        .join()
        .unwrap();
    }
}
