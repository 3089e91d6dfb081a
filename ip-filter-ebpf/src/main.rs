#![no_std]
#![no_main]

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::macros::xdp;
use aya_ebpf::programs::XdpContext;
use ip_filter_common::{Decision, FrameView, classify};

mod maps;

use maps::KernelTable;

/// Packet bounds as handed over by the driver.
struct XdpFrame {
    start: usize,
    end: usize,
}

impl XdpFrame {
    #[inline(always)]
    fn new(ctx: &XdpContext) -> Self {
        Self {
            start: ctx.data(),
            end: ctx.data_end(),
        }
    }
}

impl FrameView for XdpFrame {
    #[inline(always)]
    fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    // The verifier wants the comparison against data_end on pointer values,
    // not on a derived length.
    #[inline(always)]
    fn fits(&self, offset: usize, size: usize) -> bool {
        self.start + offset + size <= self.end
    }

    #[inline(always)]
    fn read<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        if !self.fits(offset, N) {
            return None;
        }
        let ptr = (self.start + offset) as *const [u8; N];
        Some(unsafe { core::ptr::read_unaligned(ptr) })
    }
}

#[xdp]
pub fn ip_filter(ctx: XdpContext) -> u32 {
    match classify(&XdpFrame::new(&ctx), &KernelTable) {
        Decision::Pass => xdp_action::XDP_PASS,
        Decision::Drop => xdp_action::XDP_DROP,
    }
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
