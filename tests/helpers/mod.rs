#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use usbd_dfu_boot::{
    BootConfig, DfuDevice, FlashBackend, FlashError, FlashReader, FlashScheduler, Shared,
};

use crate::mockusb::{enumerate, new_io, transact, EPErr, TestBus, TestBusIO};

pub const APP_IDLE: u8 = 0;
pub const APP_DETACH: u8 = 1;
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DNBUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_TARGET: u8 = 0x01;
pub const STATUS_ERR_FILE: u8 = 0x02;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_CHECK_ERASED: u8 = 0x05;
pub const STATUS_ERR_PROG: u8 = 0x06;
pub const STATUS_ERR_VERIFY: u8 = 0x07;
pub const STATUS_ERR_ADDRESS: u8 = 0x08;
pub const STATUS_ERR_NOTDONE: u8 = 0x09;
pub const STATUS_ERR_FIRMWARE: u8 = 0x0a;
pub const STATUS_ERR_VENDOR: u8 = 0x0b;

pub const CMD_PROG: u8 = 1;
pub const CMD_READ: u8 = 2;
pub const CMD_CHECK: u8 = 3;
pub const CMD_ERASE: u8 = 4;
pub const CMD_INFO: u8 = 5;
pub const CMD_BIN: u8 = 6;
pub const CMD_RESET: u8 = 7;

pub const DNLOAD: u8 = 1;
pub const UPLOAD: u8 = 2;
pub const GETSTATUS: u8 = 3;
pub const CLRSTATUS: u8 = 4;
pub const GETSTATE: u8 = 5;
pub const ABORT: u8 = 6;

pub const FLASH_SIZE: u32 = 64 * 1024;
pub const PAGE_SIZE: u32 = 1024;
pub const APP_START: u32 = 0x1000;

/// Expected GetStatus response.
pub fn status(status: u8, poll_timeout: u32, state: u8) -> [u8; 6] {
    let t = poll_timeout.to_le_bytes();
    [status, t[0], t[1], t[2], state, 0]
}

/// Class OUT setup packet (host to device).
pub fn class_out(request: u8, value: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let l = length.to_le_bytes();
    [0x21, request, v[0], v[1], 0, 0, l[0], l[1]]
}

/// Class IN setup packet (device to host).
pub fn class_in(request: u8, value: u16, length: u16) -> [u8; 8] {
    let v = value.to_le_bytes();
    let l = length.to_le_bytes();
    [0xa1, request, v[0], v[1], 0, 0, l[0], l[1]]
}

/// 8-byte download command header. `start_block` counts 1024-byte
/// blocks; `length` lands in bytes 4..8 (for erase, the low 16 bits are
/// the block count).
pub fn command(code: u8, arg: u8, start_block: u16, length: u32) -> [u8; 8] {
    let s = start_block.to_le_bytes();
    let l = length.to_le_bytes();
    [code, arg, s[0], s[1], l[0], l[1], l[2], l[3]]
}

pub fn test_config() -> BootConfig {
    BootConfig {
        vendor_id: 0x1cbe,
        product_id: 0x00ff,
        device_release: 0x0100,
        manufacturer: "Test",
        product: "Test DFU",
        serial_number: "0001",
        self_powered: false,
        max_power_ma: 100,
        flash_size: FLASH_SIZE,
        page_size: PAGE_SIZE,
        app_start: APP_START,
        reserved_space: 0,
        part_info: 0x1234_5678,
        class_info: 0x9abc_def0,
        code_protection: false,
        allow_self_update: false,
    }
}

/// Flash model shared between the reader and backend halves of the
/// device under test. Freshly constructed flash holds a byte pattern,
/// not the erased value, so tests notice missing erases.
#[derive(Clone)]
pub struct TestFlash {
    pub memory: Rc<RefCell<Vec<u8>>>,
    pub fail_erase: Rc<Cell<bool>>,
    pub fail_program: Rc<Cell<bool>>,
    pub erased_pages: Rc<RefCell<Vec<u32>>>,
    pub starts: Rc<Cell<u32>>,
    pub progress_log: Rc<RefCell<Vec<(u32, u32)>>>,
    pub completed: Rc<Cell<bool>>,
}

pub fn pattern(address: u32) -> u8 {
    (address as u8).wrapping_add((address >> 8) as u8)
}

/// The pattern `length` bytes of fresh flash hold at `address`.
pub fn pattern_at(address: u32, length: usize) -> Vec<u8> {
    (0..length as u32).map(|i| pattern(address + i)).collect()
}

impl TestFlash {
    pub fn new() -> Self {
        let memory = (0..FLASH_SIZE).map(pattern).collect();
        Self {
            memory: Rc::new(RefCell::new(memory)),
            fail_erase: Rc::new(Cell::new(false)),
            fail_program: Rc::new(Cell::new(false)),
            erased_pages: Rc::new(RefCell::new(Vec::new())),
            starts: Rc::new(Cell::new(0)),
            progress_log: Rc::new(RefCell::new(Vec::new())),
            completed: Rc::new(Cell::new(false)),
        }
    }

    pub fn get(&self, address: u32, length: usize) -> Vec<u8> {
        let from = address as usize;
        self.memory.borrow()[from..from + length].to_vec()
    }
}

impl FlashReader for TestFlash {
    fn read(&self, address: u32, dest: &mut [u8]) {
        let from = address as usize;
        dest.copy_from_slice(&self.memory.borrow()[from..from + dest.len()]);
    }
}

impl FlashBackend for TestFlash {
    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        if self.fail_erase.get() {
            return Err(FlashError::Erase);
        }
        assert_eq!(address % PAGE_SIZE, 0, "unaligned page erase");
        self.erased_pages.borrow_mut().push(address);
        let from = address as usize;
        self.memory.borrow_mut()[from..from + PAGE_SIZE as usize].fill(0xff);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_program.get() {
            return Err(FlashError::Program);
        }
        let from = address as usize;
        let mut memory = self.memory.borrow_mut();
        // programming can only clear bits
        for (cell, value) in memory[from..from + data.len()].iter_mut().zip(data) {
            *cell &= value;
        }
        Ok(())
    }

    fn download_start(&mut self) {
        self.starts.set(self.starts.get() + 1);
    }

    fn progress(&mut self, written: u32, total: u32) {
        self.progress_log.borrow_mut().push((written, total));
    }

    fn download_complete(&mut self) {
        self.completed.set(true);
    }

    fn system_reset(&mut self) -> ! {
        panic!("system reset");
    }
}

pub type Dfu<'a> = DfuDevice<'a, TestBus, TestFlash>;
pub type Sched<'a> = FlashScheduler<'a, TestFlash>;
pub type IoHandle = Rc<RefCell<TestBusIO>>;

/// Builds an enumerated device plus its scheduler and runs `case`.
pub fn with_dfu_config(
    config: BootConfig,
    case: impl FnOnce(&mut Dfu<'_>, &mut Sched<'_>, &IoHandle, &TestFlash),
) {
    let shared = Shared::new();
    let io = new_io();
    let flash = TestFlash::new();
    let mut dfu = DfuDevice::new(TestBus::new(&io), flash.clone(), &shared, config);
    let mut sched = FlashScheduler::new(flash.clone(), &shared, &config);
    enumerate(&mut dfu, &io);
    case(&mut dfu, &mut sched, &io, &flash);
}

pub fn with_dfu(case: impl FnOnce(&mut Dfu<'_>, &mut Sched<'_>, &IoHandle, &TestFlash)) {
    with_dfu_config(test_config(), case);
}

/// Like [`with_dfu`], but the device has not been enumerated yet.
pub fn with_raw_dfu(
    config: BootConfig,
    case: impl FnOnce(&mut Dfu<'_>, &mut Sched<'_>, &IoHandle),
) {
    let shared = Shared::new();
    let io = new_io();
    let flash = TestFlash::new();
    let mut dfu = DfuDevice::new(TestBus::new(&io), flash.clone(), &shared, config);
    let mut sched = FlashScheduler::new(flash, &shared, &config);
    case(&mut dfu, &mut sched, &io);
}

/// One DNLOAD transfer carrying `payload`. A zero length payload has no
/// data stage.
pub fn dnload(
    dfu: &mut Dfu<'_>,
    io: &IoHandle,
    payload: &[u8],
    between: impl FnMut(),
) -> Result<usize, EPErr> {
    let mut buf = [0u8; 8];
    let data = if payload.is_empty() {
        None
    } else {
        Some(payload)
    };
    transact(
        dfu,
        io,
        &class_out(DNLOAD, 0, payload.len() as u16),
        data,
        &mut buf,
        between,
    )
}

/// GetStatus, asserting the transfer itself succeeds.
pub fn get_status(dfu: &mut Dfu<'_>, io: &IoHandle) -> [u8; 6] {
    let mut buf = [0u8; 8];
    let len = transact(dfu, io, &class_in(GETSTATUS, 0, 6), None, &mut buf, || {}).expect("len");
    assert_eq!(len, 6);
    buf[..6].try_into().unwrap()
}

/// GetState, asserting the transfer itself succeeds.
pub fn get_state(dfu: &mut Dfu<'_>, io: &IoHandle) -> u8 {
    let mut buf = [0u8; 8];
    let len = transact(dfu, io, &class_in(GETSTATE, 0, 1), None, &mut buf, || {}).expect("len");
    assert_eq!(len, 1);
    buf[0]
}
