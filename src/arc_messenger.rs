//! Request/response exchange with the on-chip management microcontroller
//! (spec §4.E): a mailbox protocol on generation A, a ring-buffer queue
//! protocol on generation B.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::arch::{ArchImplementation, BarRegion, HANG_READ_VALUE};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::lock_manager::{LockManager, MutexKind};
use crate::transport::Transport;

/// An ARC message's result: a 16-bit exit code (generation A's convention;
/// generation B reports `0` for success since the queue protocol encodes
/// success/failure in the response status byte instead) plus whatever return
/// words the protocol carried back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArcMessageResponse {
    pub exit_code: u16,
    pub values: Vec<u32>,
}

/// Shared by both protocol implementations: send up to two arguments, get a
/// response, never retry internally (spec §7 "the messenger does not
/// internally retry").
pub trait ArcMessenger: Send + Sync {
    fn send_message(&self, msg_code: u32, args: &[u32], timeout: Duration) -> Result<ArcMessageResponse>;
}

fn poll_deadline(start: Instant, timeout: Duration) -> Result<()> {
    if start.elapsed() >= timeout {
        Err(DriverError::Timeout(timeout))
    } else {
        Ok(())
    }
}

/// Generation A's scratch-register mailbox protocol.
pub struct MailboxArcMessenger {
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    locks: Arc<LockManager>,
    config: DriverConfig,
    device_id: u32,
}

impl MailboxArcMessenger {
    pub fn new(arch: Arc<dyn ArchImplementation>, transport: Arc<dyn Transport>, locks: Arc<LockManager>, config: DriverConfig, device_id: u32) -> Self {
        MailboxArcMessenger {
            arch,
            transport,
            locks,
            config,
            device_id,
        }
    }

    fn apb_offset(&self, register_offset: u32) -> u64 {
        self.arch.arc_apb_bar_offset() + u64::from(register_offset)
    }
}

impl ArcMessenger for MailboxArcMessenger {
    fn send_message(&self, msg_code: u32, args: &[u32], timeout: Duration) -> Result<ArcMessageResponse> {
        let prefix = self.arch.arc_message_common_prefix().ok_or(DriverError::Unsupported {
            what: "mailbox ARC protocol on this architecture",
        })?;
        if msg_code & 0xff00 != prefix {
            return Err(DriverError::ProtocolError(format!(
                "message code 0x{msg_code:x} does not carry the expected prefix 0x{prefix:x}"
            )));
        }
        if args.len() > 2 || args.iter().any(|&a| a > 0xffff) {
            return Err(DriverError::ProtocolError("ARC mailbox messages take at most two 16-bit arguments".into()));
        }

        let _guard = self.locks.acquire(MutexKind::ArcMessage, Some(self.device_id))?;

        let arg0 = *args.first().unwrap_or(&0) & 0xffff;
        let arg1 = *args.get(1).unwrap_or(&0) & 0xffff;
        let packed = arg0 | (arg1 << 16);

        self.transport.write32(BarRegion::Bar0, self.apb_offset(self.arch.arc_scratch_data_offset()), packed)?;
        self.transport.write32(BarRegion::Bar0, self.apb_offset(self.arch.arc_scratch_status_offset()), msg_code)?;

        let misc_cntl_offset = self.apb_offset(self.arch.arc_misc_cntl_offset());
        let misc_cntl = self.transport.read32(BarRegion::Bar0, misc_cntl_offset)?;
        if misc_cntl & (1 << 16) != 0 {
            return Err(DriverError::Busy {
                what: "ARC firmware interrupt already pending",
            });
        }
        self.transport.write32(BarRegion::Bar0, misc_cntl_offset, misc_cntl | (1 << 16))?;

        let start = Instant::now();
        let status_offset = self.apb_offset(self.arch.arc_scratch_status_offset());
        loop {
            let status = self.transport.read32(BarRegion::Bar0, status_offset)?;
            if status == HANG_READ_VALUE {
                return Err(DriverError::HardwareHung);
            }
            if status & 0xff == msg_code & 0xff {
                let value = self
                    .transport
                    .read32(BarRegion::Bar0, self.apb_offset(self.arch.arc_scratch_result1_offset()))?;
                let exit_code = ((status >> 16) & 0xffff) as u16;
                return Ok(ArcMessageResponse {
                    exit_code,
                    values: vec![value],
                });
            }
            poll_deadline(start, timeout)?;
            std::thread::sleep(self.config.poll_interval);
        }
    }
}

const QUEUE_HEADER_WORDS: u64 = 4;
const QUEUE_ENTRY_WORDS: u64 = 8;
const QUEUE_OK_LIMIT: u32 = 240;

/// Generation B's ring-buffer queue protocol: request and response halves,
/// each `entries_per_queue` slots of 8 32-bit words, with a 4-word header of
/// write/read pointers (spec §4.E).
pub struct QueueArcMessenger {
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    locks: Arc<LockManager>,
    config: DriverConfig,
    device_id: u32,
}

impl QueueArcMessenger {
    pub fn new(arch: Arc<dyn ArchImplementation>, transport: Arc<dyn Transport>, locks: Arc<LockManager>, config: DriverConfig, device_id: u32) -> Self {
        QueueArcMessenger {
            arch,
            transport,
            locks,
            config,
            device_id,
        }
    }

    fn csm_offset(&self, csm_relative: u64) -> u64 {
        self.arch.arc_csm_bar_offset() + csm_relative
    }

    /// Reads the fixed scratch register firmware publishes the queue
    /// control-block descriptor pointer at, then the descriptor itself:
    /// `(base_addr, entries_per_queue)`, both CSM-relative (spec §4.E
    /// "Discovery of the queue base").
    fn discover(&self) -> Result<(u64, u32)> {
        let scratch_offset = self.arch.arc_queue_scratch_pointer_offset()?;
        let descriptor_ptr = self
            .transport
            .read32(BarRegion::Bar0, self.arch.arc_apb_bar_offset() + u64::from(scratch_offset))?;
        let base_addr = self.transport.read32(BarRegion::Bar0, self.csm_offset(u64::from(descriptor_ptr)))?;
        let entries_per_queue = self
            .transport
            .read32(BarRegion::Bar0, self.csm_offset(u64::from(descriptor_ptr) + 4))?;
        Ok((u64::from(base_addr), entries_per_queue))
    }

    fn request_entry_offset(&self, header_addr: u64, entries_per_queue: u32, slot: u32) -> u64 {
        header_addr + (QUEUE_HEADER_WORDS + u64::from(slot % entries_per_queue) * QUEUE_ENTRY_WORDS) * 4
    }

    fn response_entry_offset(&self, header_addr: u64, entries_per_queue: u32, slot: u32) -> u64 {
        header_addr + (QUEUE_HEADER_WORDS + u64::from(entries_per_queue) * QUEUE_ENTRY_WORDS + u64::from(slot % entries_per_queue) * QUEUE_ENTRY_WORDS) * 4
    }
}

impl ArcMessenger for QueueArcMessenger {
    fn send_message(&self, msg_code: u32, args: &[u32], timeout: Duration) -> Result<ArcMessageResponse> {
        if args.len() > 7 {
            return Err(DriverError::ProtocolError("ARC queue messages take at most seven arguments".into()));
        }

        let _guard = self.locks.acquire(MutexKind::ArcMessage, Some(self.device_id))?;

        let (header_addr, entries) = self.discover()?;
        let header_addr = self.csm_offset(header_addr);
        let request_wptr_offset = header_addr;
        let request_rptr_offset = header_addr + 4;
        let response_wptr_offset = header_addr + 8;
        let response_rptr_offset = header_addr + 12;

        let start = Instant::now();
        let wptr = loop {
            let wptr = self.transport.read32(BarRegion::Bar0, request_wptr_offset)?;
            let rptr = self.transport.read32(BarRegion::Bar0, request_rptr_offset)?;
            let modulus = 2 * entries;
            if wptr.wrapping_sub(rptr).rem_euclid(modulus.max(1)) != entries {
                break wptr;
            }
            poll_deadline(start, timeout)?;
            std::thread::sleep(self.config.poll_interval);
        };

        let mut entry = [0u32; QUEUE_ENTRY_WORDS as usize];
        entry[0] = msg_code;
        for (slot, &arg) in args.iter().enumerate() {
            entry[slot + 1] = arg;
        }
        let entry_offset = self.request_entry_offset(header_addr, entries, wptr);
        for (i, word) in entry.iter().enumerate() {
            self.transport.write32(BarRegion::Bar0, entry_offset + i as u64 * 4, *word)?;
        }
        self.transport
            .write32(BarRegion::Bar0, request_wptr_offset, wptr.wrapping_add(1) % (2 * entries).max(1))?;

        let resp_slot = {
            let start = Instant::now();
            loop {
                let resp_wptr = self.transport.read32(BarRegion::Bar0, response_wptr_offset)?;
                let resp_rptr = self.transport.read32(BarRegion::Bar0, response_rptr_offset)?;
                if resp_wptr != resp_rptr {
                    break resp_rptr;
                }
                poll_deadline(start, timeout)?;
                std::thread::sleep(self.config.poll_interval);
            }
        };

        let resp_offset = self.response_entry_offset(header_addr, entries, resp_slot);
        let mut response = [0u32; QUEUE_ENTRY_WORDS as usize];
        for (i, word) in response.iter_mut().enumerate() {
            *word = self.transport.read32(BarRegion::Bar0, resp_offset + i as u64 * 4)?;
        }
        self.transport
            .write32(BarRegion::Bar0, response_rptr_offset, resp_slot.wrapping_add(1) % (2 * entries).max(1))?;

        let status = response[0] & 0xff;
        if status < QUEUE_OK_LIMIT {
            Ok(ArcMessageResponse {
                exit_code: 0,
                values: vec![response[0] >> 16],
            })
        } else if status == 0xff {
            Err(DriverError::UnknownMessage(msg_code))
        } else {
            Err(DriverError::ProtocolError(format!("ARC queue response status 0x{status:x}")))
        }
    }
}

/// Minimal telemetry-table reader used by generation B's `get_clock` (spec
/// §4.F, SPEC_FULL.md §B.4). The table is a sequence of `(tag, value)` pairs
/// terminated by `tag == 0xffff_ffff`, published at a fixed CSM-relative
/// offset; this crate does not model the full telemetry tag catalogue
/// (spec §1 non-goal), only enough to look a tag up.
pub struct TelemetryReader {
    arch: Arc<dyn ArchImplementation>,
    transport: Arc<dyn Transport>,
    table_offset: u64,
}

pub const TELEMETRY_TAG_AICLK: u32 = 0x1;
const TELEMETRY_END_OF_TABLE: u32 = 0xffff_ffff;

impl TelemetryReader {
    pub fn new(arch: Arc<dyn ArchImplementation>, transport: Arc<dyn Transport>, table_offset: u64) -> Self {
        TelemetryReader {
            arch,
            transport,
            table_offset,
        }
    }

    pub fn read_tag(&self, tag: u32) -> Result<u32> {
        let base = self.arch.arc_csm_bar_offset() + self.table_offset;
        for slot in 0.. {
            let entry_tag = self.transport.read32(BarRegion::Bar0, base + slot * 8)?;
            if entry_tag == TELEMETRY_END_OF_TABLE {
                break;
            }
            if entry_tag == tag {
                return self.transport.read32(BarRegion::Bar0, base + slot * 8 + 4);
            }
        }
        Err(DriverError::UnknownMessage(tag))
    }

    pub fn get_clock(&self) -> Result<u32> {
        self.read_tag(TELEMETRY_TAG_AICLK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::gen_a::GenerationA;
    use crate::arch::gen_b::GenerationB;
    use crate::transport::SimulationBackend;

    #[test]
    fn mailbox_send_message_round_trips_through_simulation() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationA::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-arc-test")));
        let messenger = MailboxArcMessenger::new(arch.clone(), transport.clone(), locks, DriverConfig::default(), 0);

        // Simulate firmware: poll the status scratch register for the
        // triggered message and answer immediately.
        let status_offset = arch.arc_apb_bar_offset() + u64::from(arch.arc_scratch_status_offset());
        let result_offset = arch.arc_apb_bar_offset() + u64::from(arch.arc_scratch_result1_offset());
        let msg_code = arch.arc_message_codes().nop | 0xAA00;

        let transport_for_firmware = transport.clone();
        let firmware = std::thread::spawn(move || loop {
            if transport_for_firmware.read32(BarRegion::Bar0, status_offset).unwrap() == msg_code {
                transport_for_firmware.write32(BarRegion::Bar0, result_offset, 42).unwrap();
                transport_for_firmware
                    .write32(BarRegion::Bar0, status_offset, msg_code | (7 << 16))
                    .unwrap();
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        });

        let response = messenger.send_message(msg_code, &[], Duration::from_secs(1)).unwrap();
        firmware.join().unwrap();
        assert_eq!(response.values, vec![42]);
        assert_eq!(response.exit_code, 7);
    }

    #[test]
    fn mailbox_rejects_bad_prefix() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationA::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-arc-test2")));
        let messenger = MailboxArcMessenger::new(arch, transport, locks, DriverConfig::default(), 1);
        assert!(messenger.send_message(0x0011, &[], Duration::from_millis(50)).is_err());
    }

    #[test]
    fn queue_messenger_reports_unknown_message() {
        let arch: Arc<dyn ArchImplementation> = Arc::new(GenerationB::new());
        let transport: Arc<dyn Transport> = Arc::new(SimulationBackend::new());
        let locks = Arc::new(LockManager::new(std::env::temp_dir().join("tt-umd-core-arc-test3")));

        let scratch_offset = arch.arc_apb_bar_offset() + u64::from(arch.arc_queue_scratch_pointer_offset().unwrap());
        let descriptor_ptr: u32 = 0x100;
        transport.write32(BarRegion::Bar0, scratch_offset, descriptor_ptr).unwrap();
        let csm = arch.arc_csm_bar_offset();
        transport.write32(BarRegion::Bar0, csm + u64::from(descriptor_ptr), 0x1000).unwrap(); // base_addr
        transport.write32(BarRegion::Bar0, csm + u64::from(descriptor_ptr) + 4, 4).unwrap(); // entries_per_queue

        let header_addr = csm + 0x1000;
        // request_wptr=0, request_rptr=0 (queue empty)
        transport.write32(BarRegion::Bar0, header_addr, 0).unwrap();
        transport.write32(BarRegion::Bar0, header_addr + 4, 0).unwrap();
        // response: firmware immediately answers with status 0xff at slot 0
        let response_entry_offset = header_addr + (4 + 4 * 8) * 4;
        transport.write32(BarRegion::Bar0, response_entry_offset, 0xff).unwrap();
        transport.write32(BarRegion::Bar0, header_addr + 8, 1).unwrap(); // response_wptr = 1
        transport.write32(BarRegion::Bar0, header_addr + 12, 0).unwrap(); // response_rptr = 0

        let messenger = QueueArcMessenger::new(arch, transport, locks, DriverConfig::default(), 0);
        let result = messenger.send_message(0x11, &[], Duration::from_secs(1));
        assert!(matches!(result, Err(DriverError::UnknownMessage(_))));
    }
}
