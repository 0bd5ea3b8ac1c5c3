//! Print the size of the terminal on stdin as `<rows> <cols>`, like
//! `stty size`.

use std::process::ExitCode;

#[cfg(unix)]
fn terminal_size() -> Option<(u16, u16)> {
    vterm::terminal_size(&std::io::stdin()).map(|size| (size.rows, size.cols))
}

#[cfg(windows)]
fn terminal_size() -> Option<(u16, u16)> {
    use windows::Win32::System::Console::{
        GetConsoleScreenBufferInfo, GetStdHandle, CONSOLE_SCREEN_BUFFER_INFO, STD_OUTPUT_HANDLE,
    };

    // SAFETY: plain queries on the process's own console handle
    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE).ok()?;
        let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
        GetConsoleScreenBufferInfo(handle, &mut info).ok()?;
        let cols = (info.srWindow.Right - info.srWindow.Left + 1) as u16;
        let rows = (info.srWindow.Bottom - info.srWindow.Top + 1) as u16;
        Some((rows, cols))
    }
}

fn main() -> ExitCode {
    match terminal_size() {
        Some((rows, cols)) => {
            println!("{} {}", rows, cols);
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("vterm-size: stdin is not a terminal");
            ExitCode::FAILURE
        }
    }
}
