//! A small WASI snapshot-preview1 implementation over Linux syscalls.
//!
//! Every function takes the guest callee-frame base and reads its
//! arguments from the fixed slots the compiled code filled. Guest
//! pointers are 32-bit offsets resolved against the GS base.

use crate::memory::memzero_from_gs;
use std::io::Error as IoError;

// WASI errno values (snapshot preview1).
const ERRNO_SUCCESS: u32 = 0;
const ERRNO_2BIG: u32 = 1;
const ERRNO_ACCES: u32 = 2;
const ERRNO_AGAIN: u32 = 6;
const ERRNO_BADF: u32 = 8;
const ERRNO_BUSY: u32 = 10;
const ERRNO_CHILD: u32 = 12;
const ERRNO_DOM: u32 = 18;
const ERRNO_EXIST: u32 = 20;
const ERRNO_FAULT: u32 = 21;
const ERRNO_FBIG: u32 = 22;
const ERRNO_INTR: u32 = 27;
const ERRNO_INVAL: u32 = 28;
const ERRNO_IO: u32 = 29;
const ERRNO_ISDIR: u32 = 31;
const ERRNO_MFILE: u32 = 33;
const ERRNO_MLINK: u32 = 34;
const ERRNO_NFILE: u32 = 41;
const ERRNO_NODEV: u32 = 43;
const ERRNO_NOENT: u32 = 44;
const ERRNO_NOEXEC: u32 = 45;
const ERRNO_NOMEM: u32 = 48;
const ERRNO_NOSPC: u32 = 51;
const ERRNO_NOTDIR: u32 = 54;
const ERRNO_NOTTY: u32 = 59;
const ERRNO_NXIO: u32 = 60;
const ERRNO_PERM: u32 = 63;
const ERRNO_PIPE: u32 = 64;
const ERRNO_RANGE: u32 = 68;
const ERRNO_ROFS: u32 = 69;
const ERRNO_SPIPE: u32 = 70;
const ERRNO_SRCH: u32 = 71;
const ERRNO_TXTBSY: u32 = 74;
const ERRNO_XDEV: u32 = 75;

const PREOPENTYPE_DIR: u32 = 0;

const FILETYPE_BLOCK_DEVICE: u8 = 1;
const FILETYPE_CHARACTER_DEVICE: u8 = 2;
const FILETYPE_DIRECTORY: u8 = 3;
const FILETYPE_REGULAR_FILE: u8 = 4;
const FILETYPE_SYMBOLIC_LINK: u8 = 7;

const FDFLAGS_APPEND: u16 = 1;
const FDFLAGS_DSYNC: u16 = 2;
const FDFLAGS_NONBLOCK: u16 = 4;
const FDFLAGS_SYNC: u16 = 16;

const WHENCE_SET: u8 = 0;
const WHENCE_CUR: u8 = 1;
const WHENCE_END: u8 = 2;

/// Guest argument `ord`, in push order.
fn arg<T: Copy>(frame: usize, ord: usize) -> T {
    // SAFETY: the compiled caller filled 8-byte slots starting at
    // [frame + 8], one per declared parameter.
    unsafe { ((frame + 8 + 8 * ord) as *const T).read() }
}

/// Resolves a guest pointer against the GS base.
fn mem_ptr<T>(frame: usize, ord: usize) -> *mut T {
    let offset: u32 = arg(frame, ord);
    (memzero_from_gs() + offset as u64) as *mut T
}

fn errno_from_os() -> u32 {
    let err = IoError::last_os_error().raw_os_error().unwrap_or(0);
    tracing::debug!(err, "wasi host call failed");
    match err {
        libc::EPERM => ERRNO_PERM,
        libc::ENOENT => ERRNO_NOENT,
        libc::ESRCH => ERRNO_SRCH,
        libc::EINTR => ERRNO_INTR,
        libc::EIO => ERRNO_IO,
        libc::ENXIO => ERRNO_NXIO,
        libc::E2BIG => ERRNO_2BIG,
        libc::ENOEXEC => ERRNO_NOEXEC,
        libc::EBADF => ERRNO_BADF,
        libc::ECHILD => ERRNO_CHILD,
        libc::EAGAIN => ERRNO_AGAIN,
        libc::ENOMEM => ERRNO_NOMEM,
        libc::EACCES => ERRNO_ACCES,
        libc::EFAULT => ERRNO_FAULT,
        libc::EBUSY => ERRNO_BUSY,
        libc::EEXIST => ERRNO_EXIST,
        libc::EXDEV => ERRNO_XDEV,
        libc::ENODEV => ERRNO_NODEV,
        libc::ENOTDIR => ERRNO_NOTDIR,
        libc::EISDIR => ERRNO_ISDIR,
        libc::EINVAL => ERRNO_INVAL,
        libc::ENFILE => ERRNO_NFILE,
        libc::EMFILE => ERRNO_MFILE,
        libc::ENOTTY => ERRNO_NOTTY,
        libc::ETXTBSY => ERRNO_TXTBSY,
        libc::EFBIG => ERRNO_FBIG,
        libc::ENOSPC => ERRNO_NOSPC,
        libc::ESPIPE => ERRNO_SPIPE,
        libc::EROFS => ERRNO_ROFS,
        libc::EMLINK => ERRNO_MLINK,
        libc::EPIPE => ERRNO_PIPE,
        libc::EDOM => ERRNO_DOM,
        libc::ERANGE => ERRNO_RANGE,
        _ => ERRNO_INVAL,
    }
}

struct Preopen {
    fd: i32,
    path: &'static str,
}

const PREOPENS: [Preopen; 5] = [
    Preopen { fd: 0, path: "<stdin>" },
    Preopen { fd: 1, path: "<stdout>" },
    Preopen { fd: 2, path: "<stderr>" },
    Preopen { fd: -1, path: "./" },
    Preopen { fd: -1, path: "/" },
];

pub extern "C" fn fd_prestat_get(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    if !(3..PREOPENS.len() as u32).contains(&fd) {
        return ERRNO_BADF;
    }
    let buf: *mut u32 = mem_ptr(frame, 1);
    // SAFETY: guest-provided output buffer inside linear memory.
    unsafe {
        *buf = PREOPENTYPE_DIR;
        *buf.add(1) = PREOPENS[fd as usize].path.len() as u32;
    }
    ERRNO_SUCCESS
}

pub extern "C" fn fd_prestat_dir_name(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    if !(3..PREOPENS.len() as u32).contains(&fd) {
        return ERRNO_BADF;
    }
    let path: *mut u8 = mem_ptr(frame, 1);
    let path_len: u32 = arg(frame, 2);
    let name = PREOPENS[fd as usize].path.as_bytes();
    let n = name.len().min(path_len as usize);
    // SAFETY: guest output buffer of at least path_len bytes.
    unsafe { std::ptr::copy_nonoverlapping(name.as_ptr(), path, n) };
    ERRNO_SUCCESS
}

pub extern "C" fn environ_sizes_get(frame: usize) -> u32 {
    let count: *mut u32 = mem_ptr(frame, 0);
    let buf_size: *mut u32 = mem_ptr(frame, 1);
    // SAFETY: guest output slots.
    unsafe {
        *count = 0;
        *buf_size = 0;
    }
    ERRNO_SUCCESS
}

pub extern "C" fn environ_get(_frame: usize) -> u32 {
    ERRNO_SUCCESS
}

pub extern "C" fn args_sizes_get(frame: usize) -> u32 {
    let argc: *mut u32 = mem_ptr(frame, 0);
    let buf_size: *mut u32 = mem_ptr(frame, 1);
    // SAFETY: guest output slots.
    unsafe {
        *argc = 0;
        *buf_size = 0;
    }
    ERRNO_SUCCESS
}

pub extern "C" fn args_get(_frame: usize) -> u32 {
    ERRNO_SUCCESS
}

pub extern "C" fn clock_time_get(frame: usize) -> u32 {
    let clock_id: u32 = arg(frame, 0);
    // Argument 1 is the precision hint, ignored.
    let out: *mut u64 = mem_ptr(frame, 2);
    let linux_id = match clock_id {
        0 => libc::CLOCK_REALTIME,
        1 => libc::CLOCK_MONOTONIC,
        2 => libc::CLOCK_PROCESS_CPUTIME_ID,
        3 => libc::CLOCK_THREAD_CPUTIME_ID,
        _ => return ERRNO_INVAL,
    };
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-parameter.
    if unsafe { libc::clock_gettime(linux_id, &mut ts) } != 0 {
        return errno_from_os();
    }
    // SAFETY: guest output slot.
    unsafe { *out = ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64 };
    ERRNO_SUCCESS
}

pub extern "C" fn proc_exit(frame: usize) -> ! {
    let code: i32 = arg(frame, 0);
    std::process::exit(code)
}

pub extern "C" fn fd_fdstat_get(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    let fdstat: *mut u8 = mem_ptr(frame, 1);

    let (filetype, flags) = if fd < 3 {
        // SAFETY: plain fcntl/fstat on a numeric fd.
        let fl = unsafe { libc::fcntl(fd as i32, libc::F_GETFL) };
        if fl < 0 {
            return errno_from_os();
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd as i32, &mut st) } != 0 {
            return errno_from_os();
        }
        let mode = st.st_mode;
        let filetype = if mode & libc::S_IFMT == libc::S_IFBLK {
            FILETYPE_BLOCK_DEVICE
        } else if mode & libc::S_IFMT == libc::S_IFCHR {
            FILETYPE_CHARACTER_DEVICE
        } else if mode & libc::S_IFMT == libc::S_IFDIR {
            FILETYPE_DIRECTORY
        } else if mode & libc::S_IFMT == libc::S_IFLNK {
            FILETYPE_SYMBOLIC_LINK
        } else {
            FILETYPE_REGULAR_FILE
        };
        let mut flags = 0u16;
        if fl & libc::O_APPEND != 0 {
            flags |= FDFLAGS_APPEND;
        }
        if fl & libc::O_DSYNC != 0 {
            flags |= FDFLAGS_DSYNC;
        }
        if fl & libc::O_NONBLOCK != 0 {
            flags |= FDFLAGS_NONBLOCK;
        }
        if fl & libc::O_SYNC != 0 {
            flags |= FDFLAGS_SYNC;
        }
        (filetype, flags)
    } else if fd < PREOPENS.len() as u32 {
        (FILETYPE_DIRECTORY, 0)
    } else {
        (FILETYPE_REGULAR_FILE, 0)
    };

    // struct fdstat: filetype u8 @0, fdflags u16 @2, rights u64 @8, @16.
    // SAFETY: 24-byte guest output struct.
    unsafe {
        *fdstat = filetype;
        *fdstat.add(2).cast::<u16>() = flags;
        *fdstat.add(8).cast::<u64>() = u64::MAX;
        *fdstat.add(16).cast::<u64>() = u64::MAX;
    }
    ERRNO_SUCCESS
}

pub extern "C" fn fd_close(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    // SAFETY: closing a numeric fd.
    unsafe { libc::close(fd as i32) };
    ERRNO_SUCCESS
}

pub extern "C" fn fd_seek(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    let offset: i64 = arg(frame, 1);
    let whence: u8 = arg(frame, 2);
    let out: *mut u64 = mem_ptr(frame, 3);
    let whence = match whence {
        WHENCE_SET => libc::SEEK_SET,
        WHENCE_CUR => libc::SEEK_CUR,
        WHENCE_END => libc::SEEK_END,
        _ => return ERRNO_INVAL,
    };
    // SAFETY: plain lseek.
    let r = unsafe { libc::lseek(fd as i32, offset, whence) };
    if r < 0 {
        return errno_from_os();
    }
    // SAFETY: guest output slot.
    unsafe { *out = r as u64 };
    ERRNO_SUCCESS
}

#[repr(C)]
#[derive(Copy, Clone)]
struct WasiIovec {
    buf: u32,
    buf_len: u32,
}

pub extern "C" fn fd_write(frame: usize) -> u32 {
    let fd: u32 = arg(frame, 0);
    let iovs: *const WasiIovec = mem_ptr(frame, 1);
    let iovs_len: u32 = arg(frame, 2);
    let nwritten: *mut u32 = mem_ptr(frame, 3);

    let memzero = memzero_from_gs();
    let mut host_iovs = Vec::with_capacity(iovs_len as usize);
    for i in 0..iovs_len as usize {
        // SAFETY: the iovec array lives in guest linear memory.
        let iov = unsafe { *iovs.add(i) };
        host_iovs.push(libc::iovec {
            iov_base: (memzero + iov.buf as u64) as *mut libc::c_void,
            iov_len: iov.buf_len as usize,
        });
    }
    // SAFETY: every iovec points into committed guest memory.
    let r = unsafe { libc::writev(fd as i32, host_iovs.as_ptr(), iovs_len as i32) };
    if r < 0 {
        return errno_from_os();
    }
    // SAFETY: guest output slot.
    unsafe { *nwritten = r as u32 };
    ERRNO_SUCCESS
}

pub extern "C" fn poll_oneoff(_frame: usize) -> u32 {
    ERRNO_SUCCESS
}

pub extern "C" fn random_get(_frame: usize) -> u32 {
    ERRNO_SUCCESS
}
