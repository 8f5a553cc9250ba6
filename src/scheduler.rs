//! Deferred flash scheduler: the polling-loop half of the bootloader.
//!
//! Flash operations are slow and must not run inside the USB interrupt,
//! so the interrupt half only stages them in [`Shared`] and raises a
//! command flag. This loop services the flags in erase, write, reset
//! order; a failed backend operation is recorded for the interrupt half
//! to fold into the DFU status on the next GetStatus.

use core::cmp::min;

use crate::config::BootConfig;
use crate::dfu::DfuStatus;
use crate::flash::{FlashBackend, FlashError};
use crate::shared::{CommandFlags, Shared};
use crate::TRANSFER_SIZE;

/// The polling half of the bootloader.
pub struct FlashScheduler<'a, F: FlashBackend> {
    shared: &'a Shared,
    backend: F,
    page_size: u32,
    code_protection: bool,
}

impl<'a, F: FlashBackend> FlashScheduler<'a, F> {
    /// Creates the scheduler over the same [`Shared`] exchange as the
    /// device half.
    pub fn new(backend: F, shared: &'a Shared, config: &BootConfig) -> Self {
        Self {
            shared,
            backend,
            page_size: config.page_size,
            code_protection: config.code_protection,
        }
    }

    /// Services the polling loop forever. A queued reset command does
    /// not return either; it ends in [`FlashBackend::system_reset`].
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    /// Services any raised command flags once. Returns true when work
    /// was done.
    pub fn poll(&mut self) -> bool {
        let pending = self.shared.flags.pending();
        if pending == 0 {
            return false;
        }
        if pending & CommandFlags::ERASE != 0 {
            self.service_erase();
        }
        if pending & CommandFlags::WRITE != 0 {
            self.service_write();
        }
        if pending & CommandFlags::RESET != 0 {
            self.backend.system_reset();
        }
        true
    }

    fn service_erase(&mut self) {
        let block = self.shared.pending_erase.load();
        let end = block.start.saturating_add(block.length);
        let mut address = block.start;
        while address < end {
            if self.backend.erase_page(address).is_err() {
                self.shared.report_error(DfuStatus::ErrErase);
                break;
            }
            address = address.saturating_add(self.page_size);
        }
        self.shared.flags.clear(CommandFlags::ERASE);
    }

    fn service_write(&mut self) {
        let result = self.write_chunk();
        // a failure must be published before the flag clear: the clear
        // is the edge that hands the result back to the interrupt half
        match result {
            Err(FlashError::Erase) => self.shared.report_error(DfuStatus::ErrErase),
            Err(FlashError::Program) => self.shared.report_error(DfuStatus::ErrProg),
            Ok(_) => {}
        }
        self.shared.flags.clear(CommandFlags::WRITE);
        if let Ok(Some(remaining)) = result {
            let total = self.shared.image_size();
            self.backend.progress(total - remaining, total);
            if remaining == 0 {
                self.backend.download_complete();
            }
        }
    }

    /// Programs the staged chunk. Returns the image bytes still
    /// expected, or `None` when the chunk carried no image data.
    fn write_chunk(&mut self) -> Result<Option<u32>, FlashError> {
        let (offset, staged) = self.shared.staged_write();
        let length = min(staged, TRANSFER_SIZE - offset);
        let mut block = self.shared.next_download.load();

        // SAFETY: the raised Write flag hands the buffer to this
        // context until it is cleared below.
        let buf = unsafe { self.shared.transfer_buffer() };
        let data = &mut buf[offset..offset + length];
        self.backend.decrypt(data);

        let count = min(length as u32, block.length);
        if count == 0 {
            return Ok(None);
        }

        // nothing consumed from the declared image yet, so this is the
        // first chunk that carries data
        if block.length == self.shared.image_size() {
            self.backend.download_start();
        }

        if !self.code_protection {
            self.erase_for_write(block.start, count)?;
        }
        self.backend.program(block.start, &data[..count as usize])?;

        block.advance(count);
        self.shared.next_download.store(block);
        Ok(Some(block.length))
    }

    /// Erases ahead of a write: the destination page when the write
    /// starts on a page boundary, the following page when the chunk
    /// straddles one.
    fn erase_for_write(&mut self, start: u32, count: u32) -> Result<(), FlashError> {
        let end = start + count - 1;
        if start % self.page_size == 0 {
            self.backend.erase_page(start)?;
        } else if start / self.page_size != end / self.page_size {
            self.backend.erase_page((end / self.page_size) * self.page_size)?;
        }
        Ok(())
    }
}
