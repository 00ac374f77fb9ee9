//! Interactive input for install, add-user, passwd and destructive commands

use std::io::{self, BufRead, Write};
use std::os::fd::AsFd;

use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};

use crate::error::{Error, IoContext, Result};

const PASSWORD_ATTEMPTS: usize = 3;

/// Ask for one line on stderr, read it from stdin.
pub fn prompt_line(label: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", label).io_context(|| "writing prompt")?;
    stderr.flush().io_context(|| "writing prompt")?;
    read_line(&mut io::stdin().lock())
}

/// Ask for a new password twice, without echo, until both entries match.
pub fn prompt_new_password(username: &str) -> Result<String> {
    for _ in 0..PASSWORD_ATTEMPTS {
        let first = prompt_hidden(&format!("New password for {}: ", username))?;
        if first.is_empty() {
            eprintln!("Password must not be empty.");
            continue;
        }
        let second = prompt_hidden("Retype password: ")?;
        if first == second {
            return Ok(first);
        }
        eprintln!("Passwords do not match.");
    }
    Err(Error::precondition(format!(
        "no matching password entered after {} attempts",
        PASSWORD_ATTEMPTS
    )))
}

/// Yes/no question; anything but y/yes is a no.
pub fn confirm(question: &str) -> Result<bool> {
    let answer = prompt_line(&format!("{} [y/N] ", question))?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn prompt_hidden(label: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", label).io_context(|| "writing prompt")?;
    stderr.flush().io_context(|| "writing prompt")?;

    let line = {
        let _echo = EchoOff::new();
        read_line(&mut io::stdin().lock())?
    };
    eprintln!();
    Ok(line)
}

fn read_line(input: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    let read = input.read_line(&mut line).io_context(|| "reading stdin")?;
    if read == 0 {
        return Err(Error::precondition("stdin closed while waiting for input"));
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Turns terminal echo off until dropped. A no-op when stdin is not a tty.
struct EchoOff {
    saved: Option<Termios>,
}

impl EchoOff {
    fn new() -> Self {
        let stdin = io::stdin();
        let Ok(saved) = tcgetattr(stdin.as_fd()) else {
            return Self { saved: None };
        };

        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        quiet.local_flags.insert(LocalFlags::ECHONL);
        match tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &quiet) {
            Ok(()) => Self { saved: Some(saved) },
            Err(err) => {
                log::debug!("Could not disable echo: {}", err);
                Self { saved: None }
            }
        }
    }
}

impl Drop for EchoOff {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved
            && let Err(err) = tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, saved)
        {
            log::warn!("Failed to restore terminal echo: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_line_strips_newline() -> Result<()> {
        let mut input = Cursor::new("s3cret\r\nnext\n");
        assert_eq!(read_line(&mut input)?, "s3cret");
        assert_eq!(read_line(&mut input)?, "next");
        assert!(matches!(read_line(&mut input), Err(Error::PreconditionFailed(_))));
        Ok(())
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES \n"));
        assert!(!is_yes(""));
        assert!(!is_yes("nope"));
    }
}
