use std::{
    cell::{Cell, RefCell},
    cmp::min,
    rc::Rc,
};

use usb_device::bus::PollResult;
use usb_device::bus::UsbBus;
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{Result, UsbDirection, UsbError};

use usbd_dfu_boot::flash::FlashReader;
use usbd_dfu_boot::DfuDevice;

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
}

struct EP {
    alloc: bool,
    stall: bool,
    read_len: usize,
    read: [u8; 2048],
    read_ready: bool,
    write_len: usize,
    write: [u8; 2048],
    write_done: bool,
    setup: bool,
    max_size: usize,
}

impl EP {
    fn new() -> Self {
        EP {
            alloc: false,
            stall: false,
            read_len: 0,
            read: [0; 2048],
            read_ready: false,
            write_len: 0,
            write: [0; 2048],
            write_done: false,
            setup: false,
            max_size: 0,
        }
    }

    fn set_read(&mut self, data: &[u8], setup: bool) {
        self.read_len = data.len();
        self.read[..data.len()].copy_from_slice(data);
        self.setup = setup;
        self.read_ready = true;
    }

    fn get_write(&mut self, data: &mut [u8]) -> usize {
        let res = self.write_len;
        self.write_len = 0;
        data[..res].clone_from_slice(&self.write[..res]);
        self.write_done = true;
        res
    }
}

pub struct TestBusIO {
    ep_i: [RefCell<EP>; 2],
    ep_o: [RefCell<EP>; 2],
    reset: Cell<bool>,
}

unsafe impl Sync for TestBusIO {}

impl TestBusIO {
    pub fn new() -> Self {
        Self {
            ep_i: [RefCell::new(EP::new()), RefCell::new(EP::new())],
            ep_o: [RefCell::new(EP::new()), RefCell::new(EP::new())],
            reset: Cell::new(false),
        }
    }

    /// Makes the next poll report a bus reset.
    pub fn trigger_reset(&self) {
        self.reset.set(true);
    }

    fn epidx(&self, ep_addr: EndpointAddress) -> &RefCell<EP> {
        match ep_addr.direction() {
            UsbDirection::In => self.ep_i.get(ep_addr.index()).unwrap(),
            UsbDirection::Out => self.ep_o.get(ep_addr.index()).unwrap(),
        }
    }

    pub fn get_write(&self, ep_addr: EndpointAddress, data: &mut [u8]) -> usize {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        ep.get_write(data)
    }

    pub fn set_read(&self, ep_addr: EndpointAddress, data: &[u8], setup: bool) {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        if setup && ep_addr.index() == 0 && ep_addr.direction() == UsbDirection::Out {
            // setup packet on EP0OUT removes stall condition
            ep.stall = false;
            let mut ep0in = self.ep_i.get(0).unwrap().borrow_mut();
            ep0in.stall = false;
        }
        ep.set_read(data, setup)
    }

    pub fn stalled0(&self) -> bool {
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        self.epidx(in0).borrow().stall || self.epidx(out0).borrow().stall
    }
}

pub struct TestBus {
    rrio: Rc<RefCell<TestBusIO>>,
}

unsafe impl Sync for TestBus {}

impl TestBus {
    pub fn new(rrio: &Rc<RefCell<TestBusIO>>) -> Self {
        Self { rrio: rrio.clone() }
    }

    fn io(&self) -> &RefCell<TestBusIO> {
        self.rrio.as_ref()
    }
}

impl UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        _ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> Result<EndpointAddress> {
        if let Some(ea) = ep_addr {
            let io = self.io().borrow();
            let mut sep = io.epidx(ea).borrow_mut();
            assert!(!sep.alloc);
            sep.alloc = true;
            sep.stall = false;
            sep.max_size = max_packet_size as usize;

            Ok(ea)
        } else {
            panic!("ep_addr is required, endpoint allocation is not implemented");
        }
    }
    fn enable(&mut self) {}
    fn force_reset(&self) -> Result<()> {
        Ok(())
    }
    fn poll(&self) -> PollResult {
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);

        let io = self.io().borrow();
        if io.reset.replace(false) {
            return PollResult::Reset;
        }
        let ep0out = io.epidx(out0).borrow();
        let mut ep0in = io.epidx(in0).borrow_mut();

        let ep0_write_done = ep0in.write_done;
        let ep0_can_read = ep0out.read_ready;
        let ep0_setup = ep0out.setup;

        ep0in.write_done = false;

        if ep0_write_done || ep0_can_read || ep0_setup {
            PollResult::Data {
                ep_in_complete: if ep0_write_done { 1 } else { 0 },
                ep_out: if ep0_can_read { 1 } else { 0 },
                ep_setup: if ep0_setup { 1 } else { 0 },
            }
        } else {
            PollResult::None
        }
    }
    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let len = min(buf.len(), min(ep.read_len, ep.max_size));

        if len == 0 {
            return Err(UsbError::WouldBlock);
        }

        buf[..len].clone_from_slice(&ep.read[..len]);

        ep.read_len -= len;
        ep.read.copy_within(len.., 0);

        if ep.read_len == 0 {
            ep.setup = false;
        }

        ep.read_ready = ep.read_len > 0;

        Ok(len)
    }
    fn reset(&self) {}
    fn resume(&self) {}
    fn suspend(&self) {}
    fn set_device_address(&self, addr: u8) {
        assert_eq!(addr, 5);
    }
    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let io = self.io().borrow();
        let ep = io.epidx(ep_addr).borrow();
        ep.stall
    }
    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        ep.stall = stalled;
    }
    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();

        if buf.len() > ep.max_size {
            return Err(UsbError::BufferOverflow);
        }

        let offset = ep.write_len;
        ep.write[offset..offset + buf.len()].copy_from_slice(buf);
        ep.write_len += buf.len();
        ep.write_done = false;
        Ok(buf.len())
    }
}

pub const EP0_SIZE: usize = 64;

pub fn new_io() -> Rc<RefCell<TestBusIO>> {
    Rc::new(RefCell::new(TestBusIO::new()))
}

/// Runs one full control transfer against the device: SETUP, an
/// optional OUT data stage, then reads the IN data (or status) stage
/// back. `between` runs after every device poll, which is where tests
/// service the flash scheduler.
pub fn transact<M: FlashReader>(
    dfu: &mut DfuDevice<'_, TestBus, M>,
    io: &Rc<RefCell<TestBusIO>>,
    setup: &[u8],
    data: Option<&[u8]>,
    out: &mut [u8],
    mut between: impl FnMut(),
) -> core::result::Result<usize, EPErr> {
    let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
    let in0 = EndpointAddress::from_parts(0, UsbDirection::In);

    io.borrow().set_read(out0, setup, true);
    dfu.poll();
    between();
    if io.borrow().stalled0() {
        return Err(EPErr::Stalled);
    }

    if let Some(val) = data {
        io.borrow().set_read(out0, val, false);
        for i in 1..100 {
            let res = dfu.poll();
            between();
            if !res {
                break;
            }
            if i >= 99 {
                panic!("read too much");
            }
        }
        if io.borrow().stalled0() {
            return Err(EPErr::Stalled);
        }
    }

    let mut len = 0;

    loop {
        let one = io.borrow().get_write(in0, &mut out[len..]);
        dfu.poll();
        between();
        if io.borrow().stalled0() {
            return Err(EPErr::Stalled);
        }

        len += one;
        if one < EP0_SIZE {
            // short read - last block
            break;
        }
    }

    Ok(len)
}

/// Delivers a host OUT packet outside of [`transact`].
pub fn host_out(io: &Rc<RefCell<TestBusIO>>, data: &[u8]) {
    let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
    io.borrow().set_read(out0, data, false);
}

/// Injects a bus reset; the device sees it on the next poll.
pub fn bus_reset<M: FlashReader>(dfu: &mut DfuDevice<'_, TestBus, M>, io: &Rc<RefCell<TestBusIO>>) {
    io.borrow().trigger_reset();
    assert!(dfu.poll());
}

/// Basic device setup: set address, set configuration, set interface.
pub fn enumerate<M: FlashReader>(dfu: &mut DfuDevice<'_, TestBus, M>, io: &Rc<RefCell<TestBusIO>>) {
    let mut buf = [0; 8];
    let mut len;

    // set address
    len = transact(dfu, io, &[0, 0x5, 5, 0, 0, 0, 0, 0], None, &mut buf, || {}).expect("len");
    assert_eq!(len, 0);

    // set configuration
    len = transact(dfu, io, &[0, 0x9, 1, 0, 0, 0, 0, 0], None, &mut buf, || {}).expect("len");
    assert_eq!(len, 0);

    // set interface
    len = transact(dfu, io, &[1, 0xb, 0, 0, 0, 0, 0, 0], None, &mut buf, || {}).expect("len");
    assert_eq!(len, 0);
}
