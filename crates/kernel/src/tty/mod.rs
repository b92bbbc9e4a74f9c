//! TTY ioctl layer
//!
//! Owns the termios state for a terminal and dispatches the ioctl requests
//! the VFS passes through. The presentation layer stays behind the
//! [`TermVideo`] trait; this module only decides when to pause or restart
//! video output (the KD_TEXT/KD_GRAPHICS switch).

use crate::error::{Errno, Result};
use crate::uaccess::{get_user, put_user};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TCSETSW: u32 = 0x5403;
pub const TCSETSF: u32 = 0x5404;
pub const TIOCGWINSZ: u32 = 0x5413;
pub const KDSETMODE: u32 = 0x4B3A;
pub const KDGKBMODE: u32 = 0x4B44;
pub const KDSKBMODE: u32 = 0x4B45;

pub const KD_TEXT: u32 = 0x00;
pub const KD_GRAPHICS: u32 = 0x01;
pub const K_XLATE: u32 = 0x01;

pub const F_GETFL: i32 = 3;
pub const F_SETFL: i32 = 4;

// c_iflag bits
pub const ICRNL: u32 = 0o000400;
pub const IXON: u32 = 0o002000;

// c_oflag bits
pub const OPOST: u32 = 0o000001;
pub const ONLCR: u32 = 0o000004;

// c_cflag bits
pub const B38400: u32 = 0o000017;
pub const CS8: u32 = 0o000060;
pub const CREAD: u32 = 0o000200;

// c_lflag bits
pub const ISIG: u32 = 0o000001;
pub const ICANON: u32 = 0o000002;
pub const ECHO: u32 = 0o000010;
pub const ECHOE: u32 = 0o000020;
pub const ECHOK: u32 = 0o000040;
pub const ECHOCTL: u32 = 0o001000;
pub const ECHOKE: u32 = 0o004000;
pub const IEXTEN: u32 = 0o100000;

// control character indices
pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VTIME: usize = 5;
pub const VMIN: usize = 6;
pub const VSWTC: usize = 7;
pub const VSTART: usize = 8;
pub const VSTOP: usize = 9;
pub const VSUSP: usize = 10;
pub const VEOL: usize = 11;
pub const VREPRINT: usize = 12;
pub const VDISCARD: usize = 13;
pub const VWERASE: usize = 14;
pub const VLNEXT: usize = 15;
pub const VEOL2: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
    pub c_iflag: u32,
    pub c_oflag: u32,
    pub c_cflag: u32,
    pub c_lflag: u32,
    pub c_line: u8,
    pub c_cc: [u8; 32],
    pub c_ispeed: u32,
    pub c_ospeed: u32,
}

impl Default for Termios {
    /// Initial settings matching a Linux console
    fn default() -> Self {
        let mut t = Self {
            c_iflag: ICRNL | IXON,
            c_oflag: OPOST | ONLCR,
            c_cflag: CREAD | B38400 | CS8,
            c_lflag: ISIG | ICANON | ECHO | ECHOE | ECHOK | ECHOCTL | ECHOKE | IEXTEN,
            c_line: 0,
            c_cc: [0; 32],
            c_ispeed: 0,
            c_ospeed: 0,
        };

        t.c_cc[VINTR] = 0x03; // Ctrl+C
        t.c_cc[VQUIT] = 0x1C; // Ctrl+Backslash
        t.c_cc[VERASE] = 0x7F;
        t.c_cc[VKILL] = 0x15; // Ctrl+U
        t.c_cc[VEOF] = 0x04; // Ctrl+D
        t.c_cc[VMIN] = 0x01;
        t.c_cc[VSTART] = 0x11; // Ctrl+Q
        t.c_cc[VSTOP] = 0x13; // Ctrl+S
        t.c_cc[VSUSP] = 0x1A; // Ctrl+Z
        t.c_cc[VREPRINT] = 0x12; // Ctrl+R
        t.c_cc[VDISCARD] = 0x0F; // Ctrl+O
        t.c_cc[VWERASE] = 0x17; // Ctrl+W
        t.c_cc[VLNEXT] = 0x16; // Ctrl+V

        t
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WinSize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

/// The terminal presentation layer, owned elsewhere
pub trait TermVideo: Send + Sync {
    fn rows(&self) -> u16;
    fn cols(&self) -> u16;
    fn pause_video_output(&self);
    fn restart_video_output(&self);
}

pub struct Tty {
    term: &'static dyn TermVideo,
    c_term: Mutex<Termios>,
    kd_mode: AtomicU32,
}

impl Tty {
    pub fn new(term: &'static dyn TermVideo) -> Self {
        Self {
            term,
            c_term: Mutex::new(Termios::default()),
            kd_mode: AtomicU32::new(KD_TEXT),
        }
    }

    pub fn termios(&self) -> Termios {
        *self.c_term.lock()
    }

    pub fn kd_mode(&self) -> u32 {
        self.kd_mode.load(Ordering::SeqCst)
    }

    fn ioctl_tcgets(&self, argp: *mut u8) -> Result<()> {
        let t = *self.c_term.lock();
        put_user(t, argp as *mut Termios)
    }

    fn ioctl_tcsets(&self, argp: *mut u8) -> Result<()> {
        // the stored termios is only replaced once the user copy succeeded
        let new = get_user(argp as *const Termios)?;
        *self.c_term.lock() = new;
        Ok(())
    }

    fn ioctl_tiocgwinsz(&self, argp: *mut u8) -> Result<()> {
        let sz = WinSize {
            ws_row: self.term.rows(),
            ws_col: self.term.cols(),
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        put_user(sz, argp as *mut WinSize)
    }

    fn ioctl_kdsetmode(&self, opt: u32) -> Result<()> {
        match opt {
            KD_TEXT => {
                self.term.restart_video_output();
                self.kd_mode.store(KD_TEXT, Ordering::SeqCst);
                Ok(())
            }
            KD_GRAPHICS => {
                self.term.pause_video_output();
                self.kd_mode.store(KD_GRAPHICS, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn ioctl_kdgkbmode(&self, argp: *mut u8) -> Result<()> {
        // K_XLATE is the only supported mode
        put_user(K_XLATE as i32, argp as *mut i32)
    }

    fn ioctl_kdskbmode(&self, mode: u32) -> Result<()> {
        if mode == K_XLATE {
            return Ok(());
        }

        Err(Errno::EINVAL)
    }

    /// Dispatch one ioctl request. For the KD set requests the argument is
    /// the value itself, not a pointer.
    pub fn ioctl(&self, request: u32, argp: *mut u8) -> Result<()> {
        match request {
            TCGETS => self.ioctl_tcgets(argp),
            TCSETS => self.ioctl_tcsets(argp),
            // TODO: implement the drain/flush semantics of TCSETSW/TCSETSF
            TCSETSW => self.ioctl_tcsets(argp),
            TCSETSF => self.ioctl_tcsets(argp),
            TIOCGWINSZ => self.ioctl_tiocgwinsz(argp),
            KDSETMODE => self.ioctl_kdsetmode(argp as usize as u32),
            KDGKBMODE => self.ioctl_kdgkbmode(argp),
            KDSKBMODE => self.ioctl_kdskbmode(argp as usize as u32),
            _ => {
                warn!("tty: unknown ioctl request {:#x}", request);
                Err(Errno::EINVAL)
            }
        }
    }

    /// File-status flag handling for tty handles
    pub fn fcntl(&self, handle_flags: &mut u32, cmd: i32, arg: u32) -> Result<i32> {
        match cmd {
            F_GETFL => Ok(*handle_flags as i32),
            F_SETFL => {
                *handle_flags = arg;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    /// Force the console back to text mode so panic output is visible
    pub fn setup_for_panic(&self) {
        if self.kd_mode() != KD_TEXT {
            self.term.restart_video_output();
            self.kd_mode.store(KD_TEXT, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestVideo {
        pauses: AtomicU32,
        restarts: AtomicU32,
    }

    impl TestVideo {
        const fn new() -> Self {
            Self {
                pauses: AtomicU32::new(0),
                restarts: AtomicU32::new(0),
            }
        }
    }

    impl TermVideo for TestVideo {
        fn rows(&self) -> u16 {
            25
        }

        fn cols(&self) -> u16 {
            80
        }

        fn pause_video_output(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn restart_video_output(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_termios_matches_linux_console() {
        let t = Termios::default();
        assert_eq!(t.c_iflag, ICRNL | IXON);
        assert_eq!(t.c_oflag, OPOST | ONLCR);
        assert_eq!(t.c_cflag, CREAD | B38400 | CS8);
        assert_eq!(
            t.c_lflag,
            ISIG | ICANON | ECHO | ECHOE | ECHOK | ECHOCTL | ECHOKE | IEXTEN
        );

        assert_eq!(t.c_cc[VINTR], 0x03);
        assert_eq!(t.c_cc[VQUIT], 0x1C);
        assert_eq!(t.c_cc[VERASE], 0x7F);
        assert_eq!(t.c_cc[VKILL], 0x15);
        assert_eq!(t.c_cc[VEOF], 0x04);
        assert_eq!(t.c_cc[VMIN], 0x01);
        assert_eq!(t.c_cc[VSTART], 0x11);
        assert_eq!(t.c_cc[VSTOP], 0x13);
        assert_eq!(t.c_cc[VSUSP], 0x1A);
        assert_eq!(t.c_cc[VREPRINT], 0x12);
        assert_eq!(t.c_cc[VDISCARD], 0x0F);
        assert_eq!(t.c_cc[VWERASE], 0x17);
        assert_eq!(t.c_cc[VLNEXT], 0x16);
        assert_eq!(t.c_cc[VTIME], 0);
        assert_eq!(t.c_cc[VSWTC], 0);
        assert_eq!(t.c_cc[VEOL], 0);
        assert_eq!(t.c_cc[VEOL2], 0);
    }

    #[test]
    fn test_tcgets_tcsets_roundtrip() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        let mut out = Termios::default();
        out.c_iflag = 0;
        tty.ioctl(TCGETS, &mut out as *mut Termios as *mut u8)
            .unwrap();
        assert_eq!(out, Termios::default());

        let mut wanted = Termios::default();
        wanted.c_lflag &= !(ECHO | ICANON); // raw-ish mode
        wanted.c_cc[VMIN] = 0;
        tty.ioctl(TCSETS, &mut wanted as *mut Termios as *mut u8)
            .unwrap();
        assert_eq!(tty.termios(), wanted);

        // TCSETSW / TCSETSF presently share TCSETS semantics
        let mut wanted2 = Termios::default();
        tty.ioctl(TCSETSW, &mut wanted2 as *mut Termios as *mut u8)
            .unwrap();
        assert_eq!(tty.termios(), wanted2);
        wanted2.c_cc[VINTR] = 0;
        tty.ioctl(TCSETSF, &mut wanted2 as *mut Termios as *mut u8)
            .unwrap();
        assert_eq!(tty.termios(), wanted2);
    }

    #[test]
    fn test_tcsets_fault_preserves_previous_termios() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        let before = tty.termios();
        let bad = 0xFFFF_0000_0000_1000usize as *mut u8;
        assert_eq!(tty.ioctl(TCSETS, bad).unwrap_err(), Errno::EFAULT);
        assert_eq!(tty.termios(), before);
    }

    #[test]
    fn test_winsize() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        let mut sz = WinSize::default();
        tty.ioctl(TIOCGWINSZ, &mut sz as *mut WinSize as *mut u8)
            .unwrap();
        assert_eq!(sz.ws_row, 25);
        assert_eq!(sz.ws_col, 80);
    }

    #[test]
    fn test_kd_mode_switch_pauses_and_restarts_video() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);
        assert_eq!(tty.kd_mode(), KD_TEXT);

        tty.ioctl(KDSETMODE, KD_GRAPHICS as usize as *mut u8).unwrap();
        assert_eq!(tty.kd_mode(), KD_GRAPHICS);
        assert_eq!(VIDEO.pauses.load(Ordering::SeqCst), 1);

        tty.ioctl(KDSETMODE, KD_TEXT as usize as *mut u8).unwrap();
        assert_eq!(tty.kd_mode(), KD_TEXT);
        assert_eq!(VIDEO.restarts.load(Ordering::SeqCst), 1);

        assert_eq!(
            tty.ioctl(KDSETMODE, 7usize as *mut u8).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_keyboard_mode_is_xlate_only() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        let mut mode: i32 = -1;
        tty.ioctl(KDGKBMODE, &mut mode as *mut i32 as *mut u8)
            .unwrap();
        assert_eq!(mode, K_XLATE as i32);

        tty.ioctl(KDSKBMODE, K_XLATE as usize as *mut u8).unwrap();
        assert_eq!(
            tty.ioctl(KDSKBMODE, 0 as *mut u8).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_unknown_ioctl_is_einval() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);
        assert_eq!(
            tty.ioctl(0xDEAD, core::ptr::null_mut()).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_fcntl_file_status_flags() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        let mut flags = 0o4000u32; // O_NONBLOCK-style bit
        assert_eq!(tty.fcntl(&mut flags, F_GETFL, 0).unwrap(), 0o4000);
        assert_eq!(tty.fcntl(&mut flags, F_SETFL, 0).unwrap(), 0);
        assert_eq!(flags, 0);
        assert_eq!(tty.fcntl(&mut flags, 99, 0).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn test_setup_for_panic_restores_text_mode() {
        static VIDEO: TestVideo = TestVideo::new();
        let tty = Tty::new(&VIDEO);

        tty.ioctl(KDSETMODE, KD_GRAPHICS as usize as *mut u8).unwrap();
        tty.setup_for_panic();
        assert_eq!(tty.kd_mode(), KD_TEXT);
        assert_eq!(VIDEO.restarts.load(Ordering::SeqCst), 1);

        // already in text mode: nothing to restart
        tty.setup_for_panic();
        assert_eq!(VIDEO.restarts.load(Ordering::SeqCst), 1);
    }
}
