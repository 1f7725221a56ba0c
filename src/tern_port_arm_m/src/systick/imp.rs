//! SysTick programming.
use cortex_m::peripheral::{syst::SystClkSource, SYST};

use crate::SysTickOptions;

/// Program SysTick to interrupt at `tick_hz`. Called from the
/// application's startup path, after
/// [`port_boot`](crate::threading::imp::State::port_boot) has set the
/// exception priorities.
pub fn configure<Options: SysTickOptions>(syst: &mut SYST, tick_hz: u32) {
    let reload = (Options::SYSTICK_CLOCK_HZ / tick_hz as u64).saturating_sub(1) as u32;
    configure_with_reload(
        syst,
        reload,
        if Options::SYSTICK_USE_PROCESSOR_CLOCK {
            SystClkSource::Core
        } else {
            SystClkSource::External
        },
    );
}

/// Program SysTick with an explicit reload value.
pub fn configure_with_reload(syst: &mut SYST, reload: u32, source: SystClkSource) {
    debug_assert!(reload > 0 && reload < (1 << 24));
    syst.set_clock_source(source);
    syst.set_reload(reload);
    syst.clear_current();
    syst.enable_interrupt();
    syst.enable_counter();
}
