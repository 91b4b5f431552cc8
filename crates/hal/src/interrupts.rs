// Interrupt control used by `IrqSafeLock`.
//
// Bare-metal x86_64 goes through the `x86_64` crate. Host builds (tests) keep a
// per-thread mock flag so lock behaviour stays observable without touching RFLAGS.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use x86_64::instructions::interrupts;

    pub fn disable() -> u64 {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        u64::from(was_enabled)
    }

    pub fn restore(state: u64) {
        if state != 0 {
            interrupts::enable();
        }
    }

    pub fn is_enabled() -> bool {
        interrupts::are_enabled()
    }
}

#[cfg(all(
    not(all(target_arch = "x86_64", target_os = "none")),
    any(test, feature = "std")
))]
mod arch {
    use core::cell::Cell;

    std::thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn disable() -> u64 {
        u64::from(ENABLED.with(|e| e.replace(false)))
    }

    pub fn restore(state: u64) {
        ENABLED.with(|e| e.set(state != 0));
    }

    pub fn is_enabled() -> bool {
        ENABLED.with(Cell::get)
    }
}

#[cfg(not(any(all(target_arch = "x86_64", target_os = "none"), test, feature = "std")))]
mod arch {
    pub fn disable() -> u64 {
        0
    }

    pub fn restore(state: u64) {
        let _ = state;
    }

    pub fn is_enabled() -> bool {
        true
    }
}

/// [I1] Disables interrupts, [I2] returns previous state
#[inline(always)]
pub fn disable() -> u64 {
    arch::disable()
}

/// [I3] Restores previous interrupt state
#[inline(always)]
pub fn restore(state: u64) {
    arch::restore(state);
}

/// [I4] Returns true when enabled, [I5] returns false when disabled
#[inline(always)]
pub fn is_enabled() -> bool {
    arch::is_enabled()
}
