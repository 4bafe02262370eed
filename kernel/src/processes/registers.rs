/// Register frame an interrupt stub leaves on the stack.
///
/// Field order matches the stub: the selector it pushes first, then the
/// general purpose registers in `pusha` order, then what the processor pushes
/// on interrupt entry. The processor only pushes `useresp` and `ss` when the
/// interrupt came from ring 3; for a ring 0 frame those two fields overlay
/// whatever lies above it on the stack.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Registers {
    pub ds: usize,
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    /// Kernel esp at the time of `pusha`; ignored by `popa`
    pub esp_dummy: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
    pub useresp: usize,
    pub ss: usize,
}

impl Registers {
    /// Bytes an `iret` to ring 0 leaves consumed: everything below `useresp`.
    pub const KERNEL_FRAME_SIZE: usize = core::mem::offset_of!(Registers, useresp);
    /// Bytes of a frame that returns to ring 3.
    pub const USER_FRAME_SIZE: usize = core::mem::size_of::<Registers>();

    pub const fn new() -> Self {
        Self {
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut ds = f.debug_struct("Registers");

        ds.field("ds", &format_args!("{:#06x}", self.ds))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("eax", &format_args!("{:#010x}", self.eax))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("useresp", &format_args!("{:#010x}", self.useresp))
            .field("ss", &format_args!("{:#06x}", self.ss));

        ds.finish()
    }
}
