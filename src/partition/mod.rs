//! Process split
//!
//! One process, two execution contexts. The managed context is the
//! application and everything the checkpointer captures. The proxy context
//! hosts the real communication library; its thread-identity image lives in
//! an address range reserved here and is thrown away and rebuilt on every
//! restore, so no library state ever has to survive a checkpoint.

pub mod layout;
pub mod region;

pub use layout::TlsLayout;
pub use region::{page_size, RegionDescriptor, Reservation};

use std::ptr;

use crate::error::{Result, SplitError};
use crate::switch::ThreadSlot;

pub struct Partition {
    layout: TlsLayout,
    managed: RegionDescriptor,
    proxy: RegionDescriptor,
    reservation: Reservation,
}

impl Partition {
    /// Split the process: validate the calling thread's identity window,
    /// reserve `reserve` bytes for the proxy and seed its image.
    ///
    /// Any error here is fatal; there is no way to run without a valid
    /// partition.
    pub fn split(layout: TlsLayout, slot: &dyn ThreadSlot, reserve: usize) -> Result<Self> {
        let tp = slot.thread_pointer();
        // SAFETY: the slot contract guarantees the window around tp.
        unsafe { layout.check_fixed_fields(tp as *const u8, tp, tp) }.map_err(|e| {
            log::error!("Managed thread identity does not match the expected layout");
            SplitError::Partition(format!("incompatible thread library: {}", e))
        })?;

        let image_len = layout.len();
        let reservation = Reservation::reserve(reserve.max(image_len))?;

        let managed = RegionDescriptor {
            base: tp - layout.tp_offset(),
            size: image_len,
            tp_offset: layout.tp_offset(),
            initialized: true,
            generation: 0,
        };
        let proxy = RegionDescriptor {
            base: reservation.base() as usize,
            size: image_len,
            tp_offset: layout.tp_offset(),
            initialized: false,
            generation: 0,
        };

        let mut partition = Self {
            layout,
            managed,
            proxy,
            reservation,
        };
        partition.seed_proxy(slot)?;

        log::info!(
            "Process split: managed image at 0x{:x}, proxy image at 0x{:x} ({} bytes, {} reserved)",
            partition.managed.base,
            partition.proxy.base,
            image_len,
            partition.reservation.len()
        );
        Ok(partition)
    }

    /// Tear down the proxy region and build a fresh one in the same place.
    /// The managed descriptor is untouched.
    pub fn rebuild_proxy(&mut self, slot: &dyn ThreadSlot) -> Result<()> {
        self.proxy.initialized = false;
        self.reservation.discard()?;
        self.proxy.generation += 1;
        self.seed_proxy(slot)?;
        log::info!(
            "Proxy region rebuilt (generation {})",
            self.proxy.generation
        );
        Ok(())
    }

    /// Commit the image pages and fill them from the calling thread's
    /// window, with the self references pointing into the image.
    fn seed_proxy(&mut self, slot: &dyn ThreadSlot) -> Result<()> {
        self.reservation.commit(self.proxy.size)?;

        let window = slot.thread_pointer() - self.layout.tp_offset();
        let image = self.proxy.base as *mut u8;
        let image_tp = self.proxy.thread_pointer();
        unsafe {
            ptr::copy_nonoverlapping(window as *const u8, image, self.proxy.size);
            let tcb = image.add(self.layout.tp_offset());
            (tcb.add(self.layout.self_offset) as *mut usize).write_unaligned(image_tp);
            (tcb.add(self.layout.header_self_offset) as *mut usize).write_unaligned(image_tp);
        }
        self.proxy.initialized = true;
        Ok(())
    }

    pub fn layout(&self) -> &TlsLayout {
        &self.layout
    }

    pub fn managed(&self) -> &RegionDescriptor {
        &self.managed
    }

    pub fn proxy(&self) -> &RegionDescriptor {
        &self.proxy
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }
}
