// SPDX-License-Identifier: Apache-2.0

//! A scripted secure world for driving the bridge end to end.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, ThreadId};

use teeport::arg::{arg_size, Arg, AttrType, Param, CMD_CLOSE_SESSION, CMD_INVOKE_COMMAND, CMD_OPEN_SESSION};
use teeport::envelope::{RequestHeader, RequestKind};
use teeport::rpc::RpcCmd;
use teeport::smc::{rpc_val, RpcFunc, SmcRegs, CALL_WITH_ARG, RETURN_FROM_RPC, RETURN_OK};
use tzbridge::service::{Completion, CompletionSink};
use tzbridge::shm::{Shared, SharedRegion};
use tzbridge::Monitor;

/// Function the scripted TA completes immediately, echoing its input
/// into its output.
pub const FUNC_ECHO: u32 = 1;

/// Function the scripted TA serves by first making an out-call into the
/// client and echoing the client's reply into the final output.
pub const FUNC_OCALL: u32 = 2;

/// As [`FUNC_OCALL`], but the TA dawdles before issuing the out-call,
/// leaving a window in which cancellation deterministically lands first.
pub const FUNC_SLOW_OCALL: u32 = 3;

/// The rpc type the scripted TA tags its out-calls with.
pub const OCALL_TYPE: u32 = 0x55;

/// Payload the scripted TA sends with every out-call.
pub const OCALL_PING: &[u8] = b"ta-ping";

const ARG: usize = size_of::<Arg>();
const PARAM: usize = size_of::<Param>();

const OFF_CMD: usize = 0;
const OFF_FUNC: usize = 4;
const OFF_SESSION: usize = 8;
const OFF_RET: usize = 20;
const OFF_RET_ORIGIN: usize = 24;
const OFF_NUM_PARAMS: usize = 28;

fn read_u32(region: &SharedRegion, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    region.read(offset, &mut bytes);
    u32::from_le_bytes(bytes)
}

fn write_u32(region: &SharedRegion, offset: usize, value: u32) {
    region.write(offset, &value.to_le_bytes());
}

fn read_u64(region: &SharedRegion, offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    region.read(offset, &mut bytes);
    u64::from_le_bytes(bytes)
}

fn write_u64(region: &SharedRegion, offset: usize, value: u64) {
    region.write(offset, &value.to_le_bytes());
}

fn param_off(arg_offset: usize, index: usize) -> usize {
    arg_offset + ARG + index * PARAM
}

/// One suspended invoke this thread is driving.
struct Chain {
    invoke_arg: usize,
    ocall: Option<OcallScratch>,
}

struct OcallScratch {
    arg: Shared,
    input: Shared,
    output: Shared,
}

/// The scripted secure world. Each call chain runs synchronously on the
/// thread that entered, so per-chain state is keyed by thread id.
pub struct ScriptedSecure {
    region: Arc<SharedRegion>,
    next_session: AtomicU32,
    chains: Mutex<HashMap<ThreadId, Chain>>,
}

impl ScriptedSecure {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            next_session: AtomicU32::new(0x100),
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn complete(&self, arg_offset: usize, ret: u32) {
        write_u32(&self.region, arg_offset + OFF_RET, ret);
        write_u32(&self.region, arg_offset + OFF_RET_ORIGIN, 3);
    }

    fn start_invoke(&self, arg_offset: usize, regs: &mut SmcRegs) {
        let region = &self.region;
        let func = read_u32(region, arg_offset + OFF_FUNC);
        let session = read_u32(region, arg_offset + OFF_SESSION);
        let key = read_u64(region, param_off(arg_offset, 0) + 8) as u32;

        match func {
            FUNC_ECHO => {
                // Copy param[1] (input) into param[2] (output).
                let in_phys = read_u64(region, param_off(arg_offset, 1) + 8);
                let in_len = read_u64(region, param_off(arg_offset, 1) + 16) as usize;
                let out_phys = read_u64(region, param_off(arg_offset, 2) + 8);
                let out_len = read_u64(region, param_off(arg_offset, 2) + 16) as usize;

                let mut data = vec![0u8; in_len.min(out_len)];
                region.read(region.offset_of_phys(in_phys).unwrap(), &mut data);
                region.write(region.offset_of_phys(out_phys).unwrap(), &data);
                write_u64(region, param_off(arg_offset, 2) + 16, data.len() as u64);

                self.complete(arg_offset, 0);
                regs.a[0] = RETURN_OK as u64;
            }

            FUNC_OCALL | FUNC_SLOW_OCALL => {
                if func == FUNC_SLOW_OCALL {
                    thread::sleep(std::time::Duration::from_millis(150));
                }

                // Build a generic out-call command block and suspend on it.
                let input = region.alloc(OCALL_PING.len()).unwrap();
                region.write(input.offset(), OCALL_PING);
                let output = region.alloc(64).unwrap();

                let arg = region.alloc(arg_size(3)).unwrap();
                region.fill_zero(arg.offset(), arg_size(3));
                write_u32(region, arg.offset() + OFF_CMD, RpcCmd::Ocall as u32);
                write_u32(region, arg.offset() + OFF_NUM_PARAMS, 3);

                let p0 = param_off(arg.offset(), 0);
                write_u32(region, p0, AttrType::ValueInput as u32);
                write_u64(region, p0 + 8, OCALL_TYPE as u64);
                write_u64(region, p0 + 16, session as u64);
                write_u64(region, p0 + 24, key as u64);

                let p1 = param_off(arg.offset(), 1);
                write_u32(region, p1, AttrType::TmemInput as u32);
                write_u64(region, p1 + 8, region.phys_of(input.offset()));
                write_u64(region, p1 + 16, OCALL_PING.len() as u64);

                let p2 = param_off(arg.offset(), 2);
                write_u32(region, p2, AttrType::TmemOutput as u32);
                write_u64(region, p2 + 8, region.phys_of(output.offset()));
                write_u64(region, p2 + 16, output.len() as u64);

                let mut chains = self.chains.lock().unwrap();
                let chain = chains.get_mut(&thread::current().id()).unwrap();
                chain.ocall = Some(OcallScratch { arg, input, output });

                regs.a[0] = rpc_val(RpcFunc::Cmd) as u64;
                regs.write_pair(1, 2, region.phys_of(arg.offset()));
            }

            func => panic!("scripted TA has no function {func}"),
        }
    }

    fn resume(&self, regs: &mut SmcRegs) {
        let (invoke_arg, scratch) = {
            let mut chains = self.chains.lock().unwrap();
            let chain = chains.get_mut(&thread::current().id()).unwrap();
            (chain.invoke_arg, chain.ocall.take().expect("nothing to resume"))
        };
        let region = &self.region;

        let ocall_ret = read_u32(region, scratch.arg.offset() + OFF_RET);
        if ocall_ret == 0 {
            // Echo the client's reply into the invoke's output param.
            let reply_len = read_u64(region, param_off(scratch.arg.offset(), 2) + 16) as usize;
            let mut reply = vec![0u8; reply_len];
            region.read(scratch.output.offset(), &mut reply);

            let out_phys = read_u64(region, param_off(invoke_arg, 2) + 8);
            let out_len = read_u64(region, param_off(invoke_arg, 2) + 16) as usize;
            let len = reply.len().min(out_len);
            region.write(region.offset_of_phys(out_phys).unwrap(), &reply[..len]);
            write_u64(region, param_off(invoke_arg, 2) + 16, len as u64);

            self.complete(invoke_arg, 0);
        } else {
            // The out-call failed (for example: externally cancelled);
            // unwind the invoke with that code.
            self.complete(invoke_arg, ocall_ret);
        }

        region.free(scratch.arg);
        region.free(scratch.input);
        region.free(scratch.output);
        regs.a[0] = RETURN_OK as u64;
    }
}

impl Monitor for ScriptedSecure {
    fn call(&self, regs: &mut SmcRegs) {
        match regs.a[0] as u32 {
            CALL_WITH_ARG => {
                let arg_offset = self
                    .region
                    .offset_of_phys(regs.read_pair(1, 2))
                    .expect("argument block outside the shared region");

                match read_u32(&self.region, arg_offset + OFF_CMD) {
                    CMD_OPEN_SESSION => {
                        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                        write_u32(&self.region, arg_offset + OFF_SESSION, id);
                        self.complete(arg_offset, 0);
                        regs.a[0] = RETURN_OK as u64;
                    }
                    CMD_CLOSE_SESSION => {
                        self.complete(arg_offset, 0);
                        regs.a[0] = RETURN_OK as u64;
                    }
                    CMD_INVOKE_COMMAND => {
                        self.chains.lock().unwrap().insert(
                            thread::current().id(),
                            Chain {
                                invoke_arg: arg_offset,
                                ocall: None,
                            },
                        );
                        self.start_invoke(arg_offset, regs);
                    }
                    cmd => panic!("scripted secure world got command {cmd}"),
                }
            }
            RETURN_FROM_RPC => self.resume(regs),
            func => panic!("scripted secure world got function {func:#x}"),
        }
    }
}

/// Builds a command request buffer: header plus payload.
pub fn command_request(key: u32, payload: &[u8], output_len: usize) -> Vec<u8> {
    request(RequestKind::Command, key, payload, output_len)
}

/// Builds an out-call reply buffer: header plus payload.
pub fn reply_request(key: u32, payload: &[u8], output_len: usize) -> Vec<u8> {
    request(RequestKind::OcallReply, key, payload, output_len)
}

fn request(kind: RequestKind, key: u32, payload: &[u8], output_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; RequestHeader::SIZE + payload.len()];
    RequestHeader::new(key, kind, payload.len() as u64, output_len as u64).emit(&mut buf);
    buf[RequestHeader::SIZE..].copy_from_slice(payload);
    buf
}

/// A completion sink feeding a channel.
pub fn channel_sink(tx: mpsc::Sender<Completion>) -> CompletionSink {
    Box::new(move |completion| {
        let _ = tx.send(completion);
    })
}
