//! GPIB transport, delegated to the host's linux-gpib / NI-488.2 library.
//!
//! The library (`libgpib.so.0` on Linux, `gpib-32.dll` on Windows) is
//! loaded at first use. When it is absent every operation returns
//! [`InstrumentError::UnsupportedOperation`]; the core never links against
//! a GPIB SDK at build time.

use std::ffi::{c_char, c_long, c_void};
use std::sync::OnceLock;
use std::time::Duration;

use libloading::Library;
use tracing::{debug, warn};

use crate::error::Result;
use crate::resource::{ResourceDescriptor, Target};
use crate::transport::{timeout_ms, ReadTermination, Transport};
use crate::InstrumentError;

/// ibsta bits.
const IBSTA_ERR: i32 = 0x8000;
const IBSTA_TIMO: i32 = 0x4000;
const IBSTA_END: i32 = 0x0200;

/// iberr code for a timeout.
const IBERR_ETMO: i32 = 11;

/// ibconfig option: I/O timeout.
const IBC_TMO: i32 = 3;

type IbDevFn = unsafe extern "C" fn(i32, i32, i32, i32, i32, i32) -> i32;
type IbWrtFn = unsafe extern "C" fn(i32, *const c_void, c_long) -> i32;
type IbRdFn = unsafe extern "C" fn(i32, *mut c_void, c_long) -> i32;
type IbRspFn = unsafe extern "C" fn(i32, *mut c_char) -> i32;
type IbClrFn = unsafe extern "C" fn(i32) -> i32;
type IbOnlFn = unsafe extern "C" fn(i32, i32) -> i32;
type IbConfigFn = unsafe extern "C" fn(i32, i32, i32) -> i32;
type ThreadIbstaFn = unsafe extern "C" fn() -> i32;
type ThreadIberrFn = unsafe extern "C" fn() -> i32;
type ThreadIbcntlFn = unsafe extern "C" fn() -> c_long;

/// Resolved entry points of the host GPIB library.
struct GpibApi {
    // Keeps the loaded library (and thus every resolved pointer) alive for
    // the process lifetime.
    _library: Library,

    ibdev: IbDevFn,
    ibwrt: IbWrtFn,
    ibrd: IbRdFn,
    ibrsp: IbRspFn,
    ibclr: IbClrFn,
    ibonl: IbOnlFn,
    ibconfig: Option<IbConfigFn>,

    // Thread-local accessors (linux-gpib >= 4.x) with global-symbol
    // fallback (older linux-gpib, NI-488.2).
    thread_ibsta: Option<ThreadIbstaFn>,
    thread_iberr: Option<ThreadIberrFn>,
    thread_ibcntl: Option<ThreadIbcntlFn>,
    global_ibsta: Option<*mut i32>,
    global_iberr: Option<*mut i32>,
    global_ibcntl: Option<*mut c_long>,
}

// SAFETY: the function pointers and global-variable addresses stay valid
// for the process lifetime because the Library is never unloaded; the
// globals belong to the GPIB library, which defines them as process-wide
// state.
unsafe impl Send for GpibApi {}
// SAFETY: see above; concurrent reads of the status globals are no worse
// than what the C ABI of the library already exposes.
unsafe impl Sync for GpibApi {}

const fn library_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["gpib-32.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &["libgpib.dylib"]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libgpib.so.0", "libgpib.so", "libgpib.so.0.0.0"]
    }
}

fn load_api() -> Option<GpibApi> {
    let library = library_names().iter().find_map(|name| {
        // SAFETY: loading a shared library runs its initializers; the GPIB
        // libraries we name here are plain C libraries with no unusual
        // load-time behavior.
        unsafe { Library::new(name) }.ok()
    })?;

    // SAFETY: the symbol names and signatures follow the NI-488.2 /
    // linux-gpib C ABI; the symbols are only used while `library` is alive.
    unsafe {
        let ibdev = *library.get::<IbDevFn>(b"ibdev\0").ok()?;
        let ibwrt = *library.get::<IbWrtFn>(b"ibwrt\0").ok()?;
        let ibrd = *library.get::<IbRdFn>(b"ibrd\0").ok()?;
        let ibrsp = *library.get::<IbRspFn>(b"ibrsp\0").ok()?;
        let ibclr = *library.get::<IbClrFn>(b"ibclr\0").ok()?;
        let ibonl = *library.get::<IbOnlFn>(b"ibonl\0").ok()?;
        let ibconfig = library.get::<IbConfigFn>(b"ibconfig\0").ok().map(|s| *s);

        let thread_ibsta = library.get::<ThreadIbstaFn>(b"ThreadIbsta\0").ok().map(|s| *s);
        let thread_iberr = library.get::<ThreadIberrFn>(b"ThreadIberr\0").ok().map(|s| *s);
        let thread_ibcntl = library
            .get::<ThreadIbcntlFn>(b"ThreadIbcntl\0")
            .ok()
            .map(|s| *s);

        let global_ibsta = if thread_ibsta.is_none() {
            library.get::<*mut i32>(b"ibsta\0").ok().map(|s| *s)
        } else {
            None
        };
        let global_iberr = if thread_iberr.is_none() {
            library.get::<*mut i32>(b"iberr\0").ok().map(|s| *s)
        } else {
            None
        };
        let global_ibcntl = if thread_ibcntl.is_none() {
            library.get::<*mut c_long>(b"ibcntl\0").ok().map(|s| *s)
        } else {
            None
        };

        Some(GpibApi {
            _library: library,
            ibdev,
            ibwrt,
            ibrd,
            ibrsp,
            ibclr,
            ibonl,
            ibconfig,
            thread_ibsta,
            thread_iberr,
            thread_ibcntl,
            global_ibsta,
            global_iberr,
            global_ibcntl,
        })
    }
}

fn api() -> Option<&'static GpibApi> {
    static API: OnceLock<Option<GpibApi>> = OnceLock::new();
    API.get_or_init(|| {
        let api = load_api();
        if api.is_none() {
            debug!("no GPIB library found; GPIB operations unavailable");
        }
        api
    })
    .as_ref()
}

impl GpibApi {
    fn ibsta(&self) -> i32 {
        if let Some(f) = self.thread_ibsta {
            // SAFETY: resolved from the live library with the documented
            // signature.
            return unsafe { f() };
        }
        if let Some(p) = self.global_ibsta {
            // SAFETY: `p` addresses the library's process-wide ibsta int.
            return unsafe { *p };
        }
        0
    }

    fn iberr(&self) -> i32 {
        if let Some(f) = self.thread_iberr {
            // SAFETY: resolved from the live library with the documented
            // signature.
            return unsafe { f() };
        }
        if let Some(p) = self.global_iberr {
            // SAFETY: `p` addresses the library's process-wide iberr int.
            return unsafe { *p };
        }
        0
    }

    fn ibcntl(&self) -> c_long {
        if let Some(f) = self.thread_ibcntl {
            // SAFETY: resolved from the live library with the documented
            // signature.
            return unsafe { f() };
        }
        if let Some(p) = self.global_ibcntl {
            // SAFETY: `p` addresses the library's process-wide ibcntl long.
            return unsafe { *p };
        }
        0
    }

    /// Map ibsta/iberr after a call into the crate error taxonomy.
    fn check(&self, call_result: i32, operation: &str) -> Result<i32> {
        if call_result < 0 {
            return Err(InstrumentError::ProtocolError {
                details: format!("{operation} failed outright"),
            });
        }
        let sta = self.ibsta();
        if sta & IBSTA_TIMO != 0 && self.iberr() == IBERR_ETMO {
            return Err(InstrumentError::Timeout);
        }
        if sta & IBSTA_ERR != 0 {
            return Err(InstrumentError::ProtocolError {
                details: format!("{operation} failed with iberr {}", self.iberr()),
            });
        }
        Ok(sta)
    }
}

/// Map a millisecond timeout onto the coarse logarithmic T* constants
/// (`TNONE`, 1 us, 3 us, ... 300 s, 1000 s), rounding up so the device
/// waits at least as long as the caller asked for.
const fn ms_to_tmo(ms: u32) -> i32 {
    match ms {
        0 => 0,                      // TNONE
        1 => 5,                      // T1ms
        2..=3 => 6,                  // T3ms
        4..=10 => 7,                 // T10ms
        11..=30 => 8,                // T30ms
        31..=100 => 9,               // T100ms
        101..=300 => 10,             // T300ms
        301..=1000 => 11,            // T1s
        1001..=3000 => 12,           // T3s
        3001..=10_000 => 13,         // T10s
        10_001..=30_000 => 14,       // T30s
        30_001..=100_000 => 15,      // T100s
        100_001..=300_000 => 16,     // T300s
        _ => 17,                     // T1000s
    }
}

/// linux-gpib wants secondary addresses offset by 0x60; 0 means none.
const fn secondary_to_sad(secondary: Option<u8>) -> i32 {
    match secondary {
        Some(sad) => sad as i32 | 0x60,
        None => 0,
    }
}

/// A GPIB device descriptor obtained from `ibdev`.
pub struct GpibTransport {
    ud: i32,
}

impl GpibTransport {
    /// `ibdev(board, pad, sad|0x60, tmo, eot=1, eos=0)`.
    ///
    /// # Errors
    /// [`InstrumentError::UnsupportedOperation`] when no GPIB library is
    /// loadable; [`InstrumentError::ResourceNotFound`] when the device
    /// cannot be brought online.
    pub fn open(rsrc: &ResourceDescriptor, open_timeout: Duration) -> Result<Self> {
        let Target::Gpib {
            primary_address,
            secondary_address,
        } = &rsrc.target
        else {
            return Err(InstrumentError::InvalidSetup {
                details: "GPIB transport requires a GPIB resource".to_string(),
            });
        };

        let api = api().ok_or(InstrumentError::UnsupportedOperation)?;
        let tmo = ms_to_tmo(timeout_ms(open_timeout));
        let sad = secondary_to_sad(*secondary_address);

        // SAFETY: ibdev takes plain integers and returns a descriptor.
        let ud = unsafe {
            (api.ibdev)(
                i32::from(rsrc.board_number()),
                i32::from(*primary_address),
                sad,
                tmo,
                1, // assert EOI with the last byte
                0, // no EOS character
            )
        };
        if ud < 0 || api.ibsta() & IBSTA_ERR != 0 {
            return Err(InstrumentError::ResourceNotFound {
                details: format!(
                    "GPIB device {}:{} not reachable",
                    rsrc.board_number(),
                    primary_address
                ),
            });
        }
        debug!(ud, pad = *primary_address, "GPIB device online");
        Ok(Self { ud })
    }
}

impl Transport for GpibTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let api = api().ok_or(InstrumentError::UnsupportedOperation)?;
        // SAFETY: the buffer outlives the synchronous ibwrt call.
        let rc = unsafe {
            (api.ibwrt)(
                self.ud,
                buf.as_ptr().cast(),
                c_long::try_from(buf.len()).unwrap_or(c_long::MAX),
            )
        };
        api.check(rc, "ibwrt")?;
        Ok(usize::try_from(api.ibcntl()).unwrap_or(0))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, ReadTermination)> {
        let api = api().ok_or(InstrumentError::UnsupportedOperation)?;

        if let Some(ibconfig) = api.ibconfig {
            // SAFETY: ibconfig takes plain integers.
            unsafe {
                ibconfig(self.ud, IBC_TMO, ms_to_tmo(timeout_ms(timeout)));
            }
        }

        // SAFETY: the buffer outlives the synchronous ibrd call.
        let rc = unsafe {
            (api.ibrd)(
                self.ud,
                buf.as_mut_ptr().cast(),
                c_long::try_from(buf.len()).unwrap_or(c_long::MAX),
            )
        };
        let sta = api.check(rc, "ibrd")?;

        let count = usize::try_from(api.ibcntl()).unwrap_or(0).min(buf.len());
        let termination = if sta & IBSTA_END != 0 {
            // EOI asserted with the last byte.
            ReadTermination::TermChar
        } else {
            ReadTermination::Complete
        };
        Ok((count, termination))
    }

    fn read_stb(&mut self) -> Result<u16> {
        let api = api().ok_or(InstrumentError::UnsupportedOperation)?;
        let mut poll: c_char = 0;
        // SAFETY: ibrsp writes exactly one byte through the pointer.
        let rc = unsafe { (api.ibrsp)(self.ud, &mut poll) };
        api.check(rc, "ibrsp")?;
        #[allow(clippy::cast_sign_loss)]
        Ok(u16::from(poll as u8))
    }

    fn clear(&mut self) -> Result<()> {
        let api = api().ok_or(InstrumentError::UnsupportedOperation)?;
        // SAFETY: ibclr takes only the descriptor.
        let rc = unsafe { (api.ibclr)(self.ud) };
        api.check(rc, "ibclr")?;
        Ok(())
    }
}

impl Drop for GpibTransport {
    fn drop(&mut self) {
        if let Some(api) = api() {
            if self.ud >= 0 {
                // SAFETY: ibonl(ud, 0) takes the device offline.
                let rc = unsafe { (api.ibonl)(self.ud, 0) };
                if rc < 0 {
                    warn!(ud = self.ud, "ibonl failed during close");
                }
            }
        }
    }
}

#[cfg(test)]
mod unit {
    use super::{ms_to_tmo, secondary_to_sad};

    #[test]
    fn timeouts_bucket_logarithmically_rounding_up() {
        assert_eq!(ms_to_tmo(0), 0); // TNONE
        assert_eq!(ms_to_tmo(1), 5); // T1ms
        assert_eq!(ms_to_tmo(5), 7); // T10ms
        assert_eq!(ms_to_tmo(100), 9); // T100ms
        assert_eq!(ms_to_tmo(2000), 12); // T3s
        assert_eq!(ms_to_tmo(10_000), 13); // T10s
        assert_eq!(ms_to_tmo(60_000), 15); // T100s
        assert_eq!(ms_to_tmo(u32::MAX), 17); // T1000s
    }

    #[test]
    fn secondary_addresses_carry_the_0x60_offset() {
        assert_eq!(secondary_to_sad(None), 0);
        assert_eq!(secondary_to_sad(Some(0)), 0x60);
        assert_eq!(secondary_to_sad(Some(2)), 0x62);
        assert_eq!(secondary_to_sad(Some(30)), 0x7E);
    }
}
