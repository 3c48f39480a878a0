// SPDX-License-Identifier: Apache-2.0

//! Servicing callbacks issued by the secure side.
//!
//! While a privileged call is outstanding the secure OS may return to the
//! normal world with a callback request instead of a final result: to
//! allocate or free shared buffers, to have a trusted application image
//! loaded, to proxy storage, to sleep on a wait queue, or to make an
//! out-call into the client application that owns the request. The
//! [`Dispatcher`] routes each request to its handler; the caller resumes
//! the suspended call afterwards regardless of the handler's outcome.

mod loadta;
mod rpmb;
mod waitqueue;

pub use loadta::TaLoader;
pub use rpmb::{RpmbDevice, RpmbDeviceInfo};
pub use waitqueue::WaitQueues;

use crate::argbuf::ArgBuf;
use crate::shm::SharedRegion;
use crate::TeeError;

use std::mem::size_of;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use teeport::arg::{AttrType, Param};
use teeport::envelope::MAX_OCALL_INPUT;
use teeport::rpc::{
    RpcCmd, RpmbRequest, ShmKind, WaitQueueOp, RPMB_CMD_DATA_REQUEST, RPMB_CMD_GET_DEV_INFO,
    RPMB_DEV_INFO_ERROR, RPMB_DEV_INFO_OK, RpmbDevInfo,
};
use teeport::smc::{RpcFunc, SmcRegs};
use teeport::Origin;
use tracing::{trace, warn};

/// Receiver of out-calls: routes a callback bearing a session id and
/// request key back to the owning normal-world request, blocks until the
/// client application answers, and reports how many reply bytes were
/// written into `output`.
pub trait OcallHandler: Send + Sync {
    fn ocall(
        &self,
        session_id: u32,
        key: u32,
        rpc_type: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TeeError>;
}

/// Stateless dispatch of secure-side callbacks to their handlers.
pub struct Dispatcher {
    region: Arc<SharedRegion>,
    loader: Option<TaLoader>,
    rpmb: Option<Arc<dyn RpmbDevice>>,
    waitq: WaitQueues,
    ocall: RwLock<Weak<dyn OcallHandler>>,
}

impl Dispatcher {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            loader: None,
            rpmb: None,
            waitq: WaitQueues::new(),
            ocall: RwLock::new(Weak::<Never>::new()),
        }
    }

    /// Configures the trusted application store directory.
    pub fn with_ta_store(mut self, store: impl Into<Utf8PathBuf>) -> Self {
        self.loader = Some(TaLoader::new(store));
        self
    }

    /// Configures the replay-protected-storage collaborator.
    pub fn with_rpmb(mut self, device: Arc<dyn RpmbDevice>) -> Self {
        self.rpmb = Some(device);
        self
    }

    /// Installs the out-call receiver. Held weakly: the receiver owns the
    /// sessions, not the other way around.
    pub fn set_ocall_handler(&self, handler: Weak<dyn OcallHandler>) {
        *self.ocall.write().unwrap() = handler;
    }

    /// Services one callback request. The registers carry the request on
    /// entry and the handler's results on exit; the caller resumes the
    /// suspended call either way.
    pub(crate) fn dispatch(&self, func: RpcFunc, regs: &mut SmcRegs) -> Result<(), TeeError> {
        match func {
            RpcFunc::AllocArg | RpcFunc::AllocPayload | RpcFunc::OpteeAllocPayload => {
                self.alloc_buffer(regs)
            }
            RpcFunc::FreeArg | RpcFunc::FreePayload | RpcFunc::OpteeFreePayload => {
                self.free_buffer(regs)
            }
            // The interrupt was taken on the world switch itself; there
            // is nothing left to do but resume.
            RpcFunc::DeliverIrq => Ok(()),
            RpcFunc::Cmd => self.command(regs),
        }
    }

    /// Allocates a shared buffer of `a1` bytes, reporting the physical
    /// address as the cookie in both register pairs. Zero bytes means
    /// report a null cookie without allocating.
    fn alloc_buffer(&self, regs: &mut SmcRegs) -> Result<(), TeeError> {
        let size = regs.a[1] as usize;
        let phys = if size == 0 {
            0
        } else {
            let shared = self.region.alloc(size)?;
            self.region.phys_of(shared.offset())
        };

        regs.write_pair(1, 2, phys);
        regs.write_pair(4, 5, phys);
        Ok(())
    }

    /// Frees a shared buffer by its physical-address cookie.
    fn free_buffer(&self, regs: &mut SmcRegs) -> Result<(), TeeError> {
        let phys = regs.read_pair(1, 2);
        let offset = self.region.offset_of_phys(phys)?;
        self.region.free_offset(offset);
        Ok(())
    }

    /// A generic command: a secondary argument block with its own command
    /// id and parameter list. The outcome is written into the block's
    /// result fields for the secure side to read after resume.
    fn command(&self, regs: &mut SmcRegs) -> Result<(), TeeError> {
        let phys = regs.read_pair(1, 2);
        let mut buf = ArgBuf::at_phys(&self.region, phys)?;

        let cmd = buf.arg().cmd;
        trace!(cmd, num_params = buf.arg().num_params, "generic command");

        let result = match RpcCmd::try_from(cmd) {
            Ok(RpcCmd::LoadTa) => self.load_ta(&mut buf),
            Ok(RpcCmd::Rpmb) => self.rpmb(&mut buf),
            Ok(RpcCmd::GetTime) => self.get_time(&mut buf),
            Ok(RpcCmd::WaitQueue) => self.wait_queue(&buf),
            Ok(RpcCmd::Suspend) => self.suspend(&buf),
            Ok(RpcCmd::ShmAlloc) => self.shm_alloc(&mut buf),
            Ok(RpcCmd::ShmFree) => self.shm_free(&buf),
            Ok(RpcCmd::Ocall) => self.ocall(&mut buf),
            Ok(RpcCmd::Fs | RpcCmd::SqlFs | RpcCmd::Gprof | RpcCmd::Socket) => {
                Err(TeeError::NotImplemented)
            }
            Err(err) => {
                warn!(cmd, "unsupported generic command");
                Err(err)
            }
        };

        let arg = buf.arg_mut();
        arg.ret = match result {
            Ok(()) => 0,
            Err(code) => code.into(),
        };
        arg.ret_origin = Origin::Api as u32;
        result
    }

    /// Param[0]: value input, the TA identity.
    /// Param[1]: tmem output, the image buffer; a too-small buffer gets
    /// the required size written back, which is not an error.
    fn load_ta(&self, buf: &mut ArgBuf<'_>) -> Result<(), TeeError> {
        let loader = self.loader.as_ref().ok_or(TeeError::NotSupported)?;

        let params = buf.params();
        if params.len() != 2 {
            return Err(TeeError::BadParameters);
        }
        let (uuid_lo, uuid_hi, _) = params[0].as_value(AttrType::ValueInput)?;
        let (dest_phys, dest_len) = params[1].as_tmem(AttrType::TmemOutput)?;

        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[0..8].copy_from_slice(&uuid_lo.to_ne_bytes());
        uuid_bytes[8..16].copy_from_slice(&uuid_hi.to_ne_bytes());
        // The wire identity is big-endian in its leading fields.
        let uuid = teeport::TaUuid::from_bytes(uuid_bytes).swapped();

        let loaded = if dest_len == 0 {
            loader.load(&uuid, &mut [])?
        } else {
            let offset = self.region.offset_of_phys(dest_phys)?;
            // SAFETY: the buffer belongs to the suspended call this
            // thread is servicing; nothing else touches it.
            let dest = unsafe { self.region.slice_mut(offset, dest_len as usize) };
            loader.load(&uuid, dest)?
        };

        if let loadta::Loaded::Required(required) = loaded {
            buf.params_mut()[1].set_memref_size(required);
        }
        Ok(())
    }

    /// Param[0]: tmem input, request header plus frames.
    /// Param[1]: tmem output, response frames or device info.
    fn rpmb(&self, buf: &mut ArgBuf<'_>) -> Result<(), TeeError> {
        let device = self.rpmb.as_deref().ok_or(TeeError::NotSupported)?;

        let params = buf.params();
        if params.len() != 2 {
            return Err(TeeError::BadParameters);
        }
        let (in_phys, in_len) = params[0].as_tmem(AttrType::TmemInput)?;
        let (out_phys, out_len) = params[1].as_tmem(AttrType::TmemOutput)?;

        if (in_len as usize) < size_of::<RpmbRequest>() {
            return Err(TeeError::BadParameters);
        }

        let in_offset = self.region.offset_of_phys(in_phys)?;
        let out_offset = self.region.offset_of_phys(out_phys)?;

        let mut input = vec![0u8; in_len as usize];
        self.region.read(in_offset, &mut input);

        let header = RpmbRequest {
            cmd: u16::from_le_bytes([input[0], input[1]]),
            dev_id: u16::from_le_bytes([input[2], input[3]]),
            block_count: u16::from_le_bytes([input[4], input[5]]),
        };

        let mut output = vec![0u8; out_len as usize];
        let written = match header.cmd {
            RPMB_CMD_DATA_REQUEST => rpmb::data_request(
                device,
                &header,
                &input[size_of::<RpmbRequest>()..],
                &mut output,
            )?,
            RPMB_CMD_GET_DEV_INFO => {
                if (out_len as usize) < size_of::<RpmbDevInfo>() {
                    return Err(TeeError::ShortBuffer);
                }
                match device.info() {
                    Ok(info) => {
                        output[0..16].copy_from_slice(&info.cid);
                        output[16] = info.size_mult;
                        output[17] = info.rel_wr_sec_c;
                        output[18] = RPMB_DEV_INFO_OK;
                        size_of::<RpmbDevInfo>()
                    }
                    Err(err) => {
                        output[18] = RPMB_DEV_INFO_ERROR;
                        self.region.write(out_offset, &output[..size_of::<RpmbDevInfo>()]);
                        return Err(err);
                    }
                }
            }
            _ => return Err(TeeError::BadParameters),
        };

        self.region.write(out_offset, &output[..written]);
        Ok(())
    }

    /// Param[0]: value output, wall-clock time as Unix seconds and the
    /// sub-second remainder in nanoseconds.
    fn get_time(&self, buf: &mut ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 1 {
            return Err(TeeError::BadParameters);
        }
        params[0].as_value(AttrType::ValueOutput)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        debug_assert!(now.subsec_nanos() < 1_000_000_000);

        let slot = &mut buf.params_mut()[0];
        slot.a = now.as_secs();
        slot.b = now.subsec_nanos() as u64;
        Ok(())
    }

    /// Param[0]: value input, the operation and the queue key.
    fn wait_queue(&self, buf: &ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 1 {
            return Err(TeeError::BadParameters);
        }
        let (op, key, _) = params[0].as_value(AttrType::ValueInput)?;

        match WaitQueueOp::try_from(op)? {
            WaitQueueOp::Sleep => self.waitq.sleep(key),
            WaitQueueOp::Wakeup => self.waitq.wake(key),
        }
        Ok(())
    }

    /// Param[0]: value input, the duration in milliseconds.
    fn suspend(&self, buf: &ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 1 {
            return Err(TeeError::BadParameters);
        }
        let (millis, _, _) = params[0].as_value(AttrType::ValueInput)?;

        trace!(millis, "suspend");
        std::thread::sleep(Duration::from_millis(millis));
        Ok(())
    }

    /// Param[0]: value input, `(kind, size, alignment)`. On success the
    /// slot is rewritten as a tmem output carrying the aligned physical
    /// address, with the raw address as the free cookie.
    fn shm_alloc(&self, buf: &mut ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 1 {
            return Err(TeeError::BadParameters);
        }
        let (kind, size, align) = params[0].as_value(AttrType::ValueInput)?;
        ShmKind::try_from(kind)?;

        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(TeeError::BadParameters);
        }

        let shared = self
            .region
            .alloc((size as usize).checked_add(align as usize).ok_or(TeeError::OutOfMemory)?)?;
        let phys = self.region.phys_of(shared.offset());
        let aligned = (phys + align - 1) & !(align - 1);

        buf.params_mut()[0] = Param {
            attr: AttrType::TmemOutput as u32,
            pad: 0,
            a: aligned,
            b: size,
            c: phys,
        };
        Ok(())
    }

    /// Param[0]: value input, `(kind, cookie, 0)`.
    fn shm_free(&self, buf: &ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 1 {
            return Err(TeeError::BadParameters);
        }
        let (kind, cookie, _) = params[0].as_value(AttrType::ValueInput)?;
        ShmKind::try_from(kind)?;

        let offset = self.region.offset_of_phys(cookie)?;
        self.region.free_offset(offset);
        Ok(())
    }

    /// Param[0]: value input, `(rpc type, session id, request key)`.
    /// Param[1]: tmem input, the out-call payload for the application.
    /// Param[2]: tmem output, the application's reply.
    ///
    /// Blocks until the owning request's client supplies the reply or the
    /// request is cancelled.
    fn ocall(&self, buf: &mut ArgBuf<'_>) -> Result<(), TeeError> {
        let params = buf.params();
        if params.len() != 3 {
            return Err(TeeError::BadParameters);
        }
        let (rpc_type, session_id, key) = params[0].as_value(AttrType::ValueInput)?;
        let (in_phys, in_len) = params[1].as_tmem(AttrType::TmemInput)?;
        let (out_phys, out_len) = params[2].as_tmem(AttrType::TmemOutput)?;

        if in_len as usize > MAX_OCALL_INPUT {
            warn!(in_len, "out-call payload exceeds the envelope bound");
            return Err(TeeError::ExcessData);
        }

        let handler = self
            .ocall
            .read()
            .unwrap()
            .upgrade()
            .ok_or(TeeError::Communication)?;

        let in_offset = self.region.offset_of_phys(in_phys)?;
        let out_offset = self.region.offset_of_phys(out_phys)?;

        let mut input = vec![0u8; in_len as usize];
        self.region.read(in_offset, &mut input);
        let mut output = vec![0u8; out_len as usize];

        let written = handler.ocall(
            session_id as u32,
            key as u32,
            rpc_type as u32,
            &input,
            &mut output,
        )?;
        self.region.write(out_offset, &output[..written]);
        buf.params_mut()[2].set_memref_size(written as u64);
        Ok(())
    }
}

/// Placeholder receiver type for the empty weak handle.
struct Never;

impl OcallHandler for Never {
    fn ocall(&self, _: u32, _: u32, _: u32, _: &[u8], _: &mut [u8]) -> Result<usize, TeeError> {
        Err(TeeError::Communication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::anonymous_region;

    use std::fs;

    use teeport::smc::rpc_val;
    use teeport::TaUuid;

    const PHYS_BASE: u64 = 0x8000_0000;

    fn fixture() -> (Arc<SharedRegion>, Dispatcher) {
        let region = Arc::new(anonymous_region(32, PHYS_BASE).unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&region));
        (region, dispatcher)
    }

    /// Runs a generic command through the register-level entry point.
    fn run_command(dispatcher: &Dispatcher, buf: &ArgBuf<'_>) -> Result<(), TeeError> {
        let mut regs = SmcRegs::default();
        regs.a[0] = rpc_val(RpcFunc::Cmd) as u64;
        regs.write_pair(1, 2, buf.phys());
        dispatcher.dispatch(RpcFunc::Cmd, &mut regs)
    }

    #[test]
    fn alloc_and_free_by_cookie() {
        let (region, dispatcher) = fixture();

        let mut regs = SmcRegs::default();
        regs.a[0] = rpc_val(RpcFunc::AllocArg) as u64;
        regs.a[1] = 100;
        dispatcher.dispatch(RpcFunc::AllocArg, &mut regs).unwrap();

        let cookie = regs.read_pair(4, 5);
        assert_eq!(cookie, regs.read_pair(1, 2));
        assert_eq!(region.occupied_granules(), 1);

        let mut regs = SmcRegs::default();
        regs.a[0] = rpc_val(RpcFunc::FreeArg) as u64;
        regs.write_pair(1, 2, cookie);
        dispatcher.dispatch(RpcFunc::FreeArg, &mut regs).unwrap();
        assert_eq!(region.occupied_granules(), 0);
    }

    #[test]
    fn zero_byte_alloc_reports_null() {
        let (region, dispatcher) = fixture();

        let mut regs = SmcRegs::default();
        regs.a[0] = rpc_val(RpcFunc::AllocPayload) as u64;
        regs.a[1] = 0;
        dispatcher.dispatch(RpcFunc::AllocPayload, &mut regs).unwrap();
        assert_eq!(regs.read_pair(4, 5), 0);
        assert_eq!(region.occupied_granules(), 0);
    }

    #[test]
    fn get_time_is_sane() {
        let (region, dispatcher) = fixture();

        let mut buf = ArgBuf::alloc(&region, 1).unwrap();
        buf.arg_mut().cmd = RpcCmd::GetTime as u32;
        buf.params_mut()[0] = Param::value(AttrType::ValueOutput, 0, 0, 0);

        run_command(&dispatcher, &buf).unwrap();
        assert_eq!(buf.arg().ret, 0);

        let (secs, nanos, _) = buf.params()[0].as_value(AttrType::ValueOutput).unwrap();
        assert!(secs > 1_600_000_000, "epoch seconds {secs} look wrong");
        assert!(nanos < 1_000_000_000);
        buf.free();
    }

    #[test]
    fn wrong_parameter_shape_is_rejected() {
        let (region, dispatcher) = fixture();

        // GetTime with a value *input* violates the shape.
        let mut buf = ArgBuf::alloc(&region, 1).unwrap();
        buf.arg_mut().cmd = RpcCmd::GetTime as u32;
        buf.params_mut()[0] = Param::value(AttrType::ValueInput, 0, 0, 0);

        assert_eq!(run_command(&dispatcher, &buf), Err(TeeError::BadParameters));
        assert_eq!(buf.arg().ret, TeeError::BadParameters as u32);
        buf.free();
    }

    #[test]
    fn shm_alloc_honors_kind_and_alignment() {
        let (region, dispatcher) = fixture();

        let mut buf = ArgBuf::alloc(&region, 1).unwrap();
        buf.arg_mut().cmd = RpcCmd::ShmAlloc as u32;
        buf.params_mut()[0] = Param::value(AttrType::ValueInput, 1, 100, 256);
        run_command(&dispatcher, &buf).unwrap();

        let slot = buf.params()[0];
        assert_eq!(slot.attr_type().unwrap(), AttrType::TmemOutput);
        assert_eq!(slot.a % 256, 0);
        assert_eq!(slot.b, 100);
        buf.free();

        // Free it back through the cookie path.
        let mut buf = ArgBuf::alloc(&region, 1).unwrap();
        buf.arg_mut().cmd = RpcCmd::ShmFree as u32;
        buf.params_mut()[0] = Param::value(AttrType::ValueInput, 1, slot.c, 0);
        run_command(&dispatcher, &buf).unwrap();
        buf.free();
        assert_eq!(region.occupied_granules(), 0);

        // Unknown kind is a closed-set violation.
        let mut buf = ArgBuf::alloc(&region, 1).unwrap();
        buf.arg_mut().cmd = RpcCmd::ShmAlloc as u32;
        buf.params_mut()[0] = Param::value(AttrType::ValueInput, 2, 100, 0);
        assert_eq!(run_command(&dispatcher, &buf), Err(TeeError::BadParameters));
        buf.free();
    }

    #[test]
    fn filesystem_commands_are_unimplemented() {
        let (region, dispatcher) = fixture();

        let mut buf = ArgBuf::alloc(&region, 0).unwrap();
        buf.arg_mut().cmd = RpcCmd::Fs as u32;
        assert_eq!(run_command(&dispatcher, &buf), Err(TeeError::NotImplemented));
        assert_eq!(buf.arg().ret, TeeError::NotImplemented as u32);
        buf.free();
    }

    #[test]
    fn load_ta_size_discovery() {
        let region = Arc::new(anonymous_region(32, PHYS_BASE).unwrap());

        let store = std::env::temp_dir().join(format!("tzbridge-ta-{}", std::process::id()));
        fs::create_dir_all(&store).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&region))
            .with_ta_store(store.to_str().unwrap().to_string());

        let uuid = TaUuid::new(0x1234_5678, 0x9abc, 0xdef0, [1, 2, 3, 4, 5, 6, 7, 8]);
        let image: Vec<u8> = (0..=255).cycle().take(1000).collect();
        fs::write(store.join(format!("{uuid}.ta")), &image).unwrap();

        let wire_uuid = uuid.swapped().to_bytes();
        let make_buf = |dest: Option<(u64, u64)>| {
            let mut buf = ArgBuf::alloc(&region, 2).unwrap();
            buf.arg_mut().cmd = RpcCmd::LoadTa as u32;
            buf.params_mut()[0] = Param::value(
                AttrType::ValueInput,
                u64::from_ne_bytes(wire_uuid[0..8].try_into().unwrap()),
                u64::from_ne_bytes(wire_uuid[8..16].try_into().unwrap()),
                0,
            );
            let (phys, len) = dest.unwrap_or((0, 0));
            buf.params_mut()[1] = Param::tmem(AttrType::TmemOutput, phys, len);
            buf
        };

        // First pass: empty destination discovers the size.
        let probe = make_buf(None);
        run_command(&dispatcher, &probe).unwrap();
        assert_eq!(probe.arg().ret, 0);
        let (_, required) = probe.params()[1].as_tmem(AttrType::TmemOutput).unwrap();
        assert_eq!(required, image.len() as u64);
        probe.free();

        // Second pass: a buffer of the reported size gets the content.
        let dest = region.alloc(required as usize).unwrap();
        let buf = make_buf(Some((region.phys_of(dest.offset()), required)));
        run_command(&dispatcher, &buf).unwrap();
        assert_eq!(buf.arg().ret, 0);

        let mut loaded = vec![0u8; image.len()];
        region.read(dest.offset(), &mut loaded);
        assert_eq!(loaded, image);

        region.free(dest);
        buf.free();
        fs::remove_dir_all(&store).unwrap();
    }

    #[test]
    fn missing_image_is_generic_error() {
        let region = Arc::new(anonymous_region(8, PHYS_BASE).unwrap());
        let store = std::env::temp_dir().join(format!("tzbridge-ta-missing-{}", std::process::id()));
        fs::create_dir_all(&store).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&region))
            .with_ta_store(store.to_str().unwrap().to_string());

        let wire_uuid = TaUuid::default().swapped().to_bytes();
        let mut buf = ArgBuf::alloc(&region, 2).unwrap();
        buf.arg_mut().cmd = RpcCmd::LoadTa as u32;
        buf.params_mut()[0] = Param::value(
            AttrType::ValueInput,
            u64::from_ne_bytes(wire_uuid[0..8].try_into().unwrap()),
            u64::from_ne_bytes(wire_uuid[8..16].try_into().unwrap()),
            0,
        );
        buf.params_mut()[1] = Param::tmem(AttrType::TmemOutput, 0, 0);

        assert_eq!(run_command(&dispatcher, &buf), Err(TeeError::Generic));
        buf.free();
        fs::remove_dir_all(&store).unwrap();
    }
}
