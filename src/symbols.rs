//! Accessors for the page-aligned section boundaries the linker script
//! (`virt.lds`) provides. Each symbol is an opaque zero-sized object whose
//! *address* is the value we want; there is nothing to read through them.

extern "C" {
    static TEXT_START: u8;
    static TEXT_END: u8;
    static RODATA_START: u8;
    static RODATA_END: u8;
    static DATA_START: u8;
    static DATA_END: u8;
    static BSS_START: u8;
    static BSS_END: u8;
    static STACK_START: u8;
    static STACK_END: u8;
    static HEAP_START: u8;
    static MEMORY_END: u8;
    static HEAP_SIZE: u8;
}

macro_rules! symbol_fn {
    ($name:ident, $sym:ident) => {
        #[inline]
        pub fn $name() -> usize {
            unsafe { &$sym as *const u8 as usize }
        }
    };
}

symbol_fn!(text_start, TEXT_START);
symbol_fn!(text_end, TEXT_END);
symbol_fn!(rodata_start, RODATA_START);
symbol_fn!(rodata_end, RODATA_END);
symbol_fn!(data_start, DATA_START);
symbol_fn!(data_end, DATA_END);
symbol_fn!(bss_start, BSS_START);
symbol_fn!(bss_end, BSS_END);
symbol_fn!(stack_start, STACK_START);
symbol_fn!(stack_end, STACK_END);
symbol_fn!(heap_start, HEAP_START);
symbol_fn!(memory_end, MEMORY_END);

/// `HEAP_SIZE` is the one non-address export: the linker defines it as a byte
/// count (`MEMORY_END - HEAP_START`), so its address *is* the value.
#[inline]
pub fn heap_size() -> usize {
    unsafe { &HEAP_SIZE as *const u8 as usize }
}
