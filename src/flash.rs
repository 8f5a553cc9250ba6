//! Flash access traits provided by the board support code.

/// A failed flash operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FlashError {
    /// A page erase did not complete.
    Erase,
    /// Programming did not complete or did not verify.
    Program,
}

/// Read-only flash access used from USB interrupt context.
///
/// Uploads and the erase-check command read flash directly while
/// handling a control transfer, so these reads must be cheap. On
/// memory-mapped flash this is a plain copy.
pub trait FlashReader {
    /// Copies `dest.len()` bytes starting at `address` into `dest`.
    fn read(&self, address: u32, dest: &mut [u8]);

    /// Reads one little-endian word at `address`.
    fn read_word(&self, address: u32) -> u32 {
        let mut word = [0u8; 4];
        self.read(address, &mut word);
        u32::from_le_bytes(word)
    }
}

/// Mutating flash operations and board hooks, used only by the
/// [`FlashScheduler`](crate::FlashScheduler) outside of interrupt
/// context.
///
/// `decrypt` and the `download_start`/`progress`/`download_complete`
/// notifications have no-op defaults.
pub trait FlashBackend {
    /// Erases the page containing `address`.
    fn erase_page(&mut self, address: u32) -> Result<(), FlashError>;

    /// Programs `data` at `address`. The destination has been erased
    /// beforehand unless the chunk continues inside an already erased
    /// page.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// In-place decryption of a received chunk before it is programmed.
    fn decrypt(&mut self, _data: &mut [u8]) {}

    /// Called once per download, before the first image chunk is
    /// programmed.
    fn download_start(&mut self) {}

    /// Called after each programmed chunk with the number of image bytes
    /// written so far and the total declared image length.
    fn progress(&mut self, _written: u32, _total: u32) {}

    /// Called once the declared image length has been fully programmed.
    fn download_complete(&mut self) {}

    /// Resets the system. Does not return.
    fn system_reset(&mut self) -> !;
}
