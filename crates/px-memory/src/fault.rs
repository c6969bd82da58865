//! Process-wide memory protection fault interception
//!
//! Independent owners register a handler keyed by an identity value. The
//! first registration installs the OS level `SIGSEGV`/`SIGBUS` handlers and
//! removing the last one restores the previous actions. On a fault every
//! handler is offered the fault in registration order until one reports
//! that execution can continue; if all decline, the fault is passed to the
//! previously installed OS handler.

use parking_lot::{const_mutex, Mutex};
use px_core::error::MemoryError;
use std::cell::Cell;
use std::sync::Arc;

/// Details of a protection fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Host address of the faulting instruction (0 if unknown)
    pub exception_pc: usize,
    /// Host address that was accessed
    pub fault_address: usize,
    /// Whether the access was a store. Hosts that don't report the access
    /// direction claim a store.
    pub is_write: bool,
}

/// Outcome of offering a fault to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The cause was fixed, retry the faulting instruction
    ContinueExecution,
    /// Not ours, offer it to the next handler
    ExecuteNextHandler,
}

/// A registered fault handler
pub type FaultHandler = Arc<dyn Fn(&FaultInfo) -> HandlerResult + Send + Sync>;

struct Registry {
    handlers: Vec<(usize, FaultHandler)>,
    #[cfg(unix)]
    previous: Option<os::PreviousActions>,
}

static REGISTRY: Mutex<Registry> = const_mutex(Registry {
    handlers: Vec::new(),
    #[cfg(unix)]
    previous: None,
});

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// Register `handler` for `owner`. Each owner may register once.
pub fn install_handler(owner: usize, handler: FaultHandler) -> Result<(), MemoryError> {
    let mut registry = REGISTRY.lock();
    if registry.handlers.iter().any(|(o, _)| *o == owner) {
        return Err(MemoryError::FaultHandler(format!(
            "owner {:#x} already has a handler",
            owner
        )));
    }

    if registry.handlers.is_empty() {
        activate(&mut registry)?;
    }

    registry.handlers.push((owner, handler));
    tracing::debug!("Installed fault handler for owner {:#x}", owner);
    Ok(())
}

/// Remove the handler of `owner`. Returns false if none was registered.
pub fn remove_handler(owner: usize) -> bool {
    let mut registry = REGISTRY.lock();
    let Some(index) = registry.handlers.iter().position(|(o, _)| *o == owner) else {
        return false;
    };

    registry.handlers.remove(index);
    if registry.handlers.is_empty() {
        deactivate(&mut registry);
    }

    tracing::debug!("Removed fault handler for owner {:#x}", owner);
    true
}

/// Number of registered handlers
pub fn handler_count() -> usize {
    REGISTRY.lock().handlers.len()
}

/// Offer a fault to every handler in registration order.
///
/// Runs in signal context: it never blocks on the registry lock and never
/// allocates. A fault raised while a handler is running is declined.
pub fn dispatch(info: &FaultInfo) -> HandlerResult {
    if IN_HANDLER.with(|flag| flag.replace(true)) {
        return HandlerResult::ExecuteNextHandler;
    }

    let mut result = HandlerResult::ExecuteNextHandler;
    let mut guard = None;
    for _ in 0..(1 << 16) {
        guard = REGISTRY.try_lock();
        if guard.is_some() {
            break;
        }
        std::hint::spin_loop();
    }

    if let Some(registry) = guard {
        for (_, handler) in registry.handlers.iter() {
            if handler(info) == HandlerResult::ContinueExecution {
                result = HandlerResult::ContinueExecution;
                break;
            }
        }
    }

    IN_HANDLER.with(|flag| flag.set(false));
    result
}

#[cfg(unix)]
fn activate(registry: &mut Registry) -> Result<(), MemoryError> {
    registry.previous = Some(os::install()?);
    Ok(())
}

#[cfg(not(unix))]
fn activate(_registry: &mut Registry) -> Result<(), MemoryError> {
    Err(MemoryError::FaultHandler(
        "fault interception is not available on this host".into(),
    ))
}

#[cfg(unix)]
fn deactivate(registry: &mut Registry) {
    if let Some(previous) = registry.previous.take() {
        os::restore(&previous);
    }
}

#[cfg(not(unix))]
fn deactivate(_registry: &mut Registry) {}

#[cfg(unix)]
mod os {
    use super::{dispatch, FaultInfo, HandlerResult, REGISTRY};
    use libc::{c_int, c_void, siginfo_t};
    use px_core::error::MemoryError;

    pub struct PreviousActions {
        segv: libc::sigaction,
        bus: libc::sigaction,
    }

    // Safety: plain old data copied out of the kernel
    unsafe impl Send for PreviousActions {}

    pub fn install() -> Result<PreviousActions, MemoryError> {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = signal_handler;
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);

            let mut segv: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, &action, &mut segv) != 0 {
                return Err(MemoryError::FaultHandler("sigaction(SIGSEGV) failed".into()));
            }

            let mut bus: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGBUS, &action, &mut bus) != 0 {
                libc::sigaction(libc::SIGSEGV, &segv, std::ptr::null_mut());
                return Err(MemoryError::FaultHandler("sigaction(SIGBUS) failed".into()));
            }

            Ok(PreviousActions { segv, bus })
        }
    }

    pub fn restore(previous: &PreviousActions) {
        unsafe {
            libc::sigaction(libc::SIGSEGV, &previous.segv, std::ptr::null_mut());
            libc::sigaction(libc::SIGBUS, &previous.bus, std::ptr::null_mut());
        }
    }

    extern "C" fn signal_handler(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
        let fault_address = unsafe { fault_address(info) };
        let (exception_pc, is_write) = unsafe { context_details(ctx) };
        let fault = FaultInfo {
            exception_pc,
            fault_address,
            is_write,
        };

        if dispatch(&fault) == HandlerResult::ContinueExecution {
            return;
        }

        unsafe { chain(sig, info, ctx) };
    }

    /// Pass the fault to whoever owned the signal before us, or restore the
    /// default action so the retried access terminates the process.
    unsafe fn chain(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
        let previous = REGISTRY.try_lock().and_then(|registry| {
            registry.previous.as_ref().map(|p| {
                if sig == libc::SIGBUS {
                    p.bus
                } else {
                    p.segv
                }
            })
        });

        match previous {
            Some(prev)
                if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN =>
            {
                if prev.sa_flags & libc::SA_SIGINFO != 0 {
                    let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                        std::mem::transmute(prev.sa_sigaction);
                    handler(sig, info, ctx);
                } else {
                    let handler: extern "C" fn(c_int) = std::mem::transmute(prev.sa_sigaction);
                    handler(sig);
                }
            }
            _ => {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn fault_address(info: *mut siginfo_t) -> usize {
        (*info).si_addr() as usize
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn fault_address(info: *mut siginfo_t) -> usize {
        (*info).si_addr as usize
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    unsafe fn context_details(ctx: *mut c_void) -> (usize, bool) {
        let uc = ctx as *const libc::ucontext_t;
        let gregs = &(*uc).uc_mcontext.gregs;
        let pc = gregs[libc::REG_RIP as usize] as usize;
        // Page fault error code bit 1 is set for writes
        let is_write = gregs[libc::REG_ERR as usize] & 2 != 0;
        (pc, is_write)
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    unsafe fn context_details(ctx: *mut c_void) -> (usize, bool) {
        let uc = ctx as *const libc::ucontext_t;
        ((*uc).uc_mcontext.pc as usize, true)
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    unsafe fn context_details(_ctx: *mut c_void) -> (usize, bool) {
        (0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Owners are unique per test so tests can run in parallel.
    #[test]
    fn test_duplicate_owner_rejected() {
        let owner = 0xF00D_0001;
        let handler: FaultHandler = Arc::new(|_| HandlerResult::ExecuteNextHandler);
        install_handler(owner, handler.clone()).unwrap();
        assert!(install_handler(owner, handler).is_err());
        assert!(remove_handler(owner));
        assert!(!remove_handler(owner));
    }

    #[test]
    fn test_dispatch_order() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let calls = first_calls.clone();
        install_handler(
            0xF00D_0002,
            Arc::new(move |info: &FaultInfo| {
                calls.fetch_add(1, Ordering::SeqCst);
                if info.fault_address == 0x1000 {
                    HandlerResult::ContinueExecution
                } else {
                    HandlerResult::ExecuteNextHandler
                }
            }),
        )
        .unwrap();

        let calls = second_calls.clone();
        install_handler(
            0xF00D_0003,
            Arc::new(move |info: &FaultInfo| {
                calls.fetch_add(1, Ordering::SeqCst);
                if info.fault_address == 0x2000 {
                    HandlerResult::ContinueExecution
                } else {
                    HandlerResult::ExecuteNextHandler
                }
            }),
        )
        .unwrap();

        let fault = |addr| FaultInfo {
            exception_pc: 0,
            fault_address: addr,
            is_write: true,
        };

        assert_eq!(dispatch(&fault(0x1000)), HandlerResult::ContinueExecution);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);

        assert_eq!(dispatch(&fault(0x2000)), HandlerResult::ContinueExecution);
        assert_eq!(dispatch(&fault(0x3000)), HandlerResult::ExecuteNextHandler);
        assert_eq!(second_calls.load(Ordering::SeqCst), 2);

        assert!(remove_handler(0xF00D_0002));
        assert!(remove_handler(0xF00D_0003));
    }
}
