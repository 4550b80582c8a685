use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::{pipe2, read, write};

use crate::error::{Ctx, Error, Result};

// one rendezvous byte per named phase boundary; a read blocks until the
// peer writes, EOF means the peer died before reaching the phase
pub struct Pipe {
    rx: Option<OwnedFd>,
    tx: Option<OwnedFd>,
}

impl Pipe {
    // cloexec keeps the rendezvous fds out of the sandboxed program and
    // out of helper workers
    pub fn new() -> Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).ctx("pipe")?;
        Ok(Pipe {
            rx: Some(rx),
            tx: Some(tx),
        })
    }

    // each side closes the end it does not use right after the split
    pub fn drop_rx(&mut self) {
        self.rx.take();
    }

    pub fn drop_tx(&mut self) {
        self.tx.take();
    }

    pub fn notify(&self) -> Result<()> {
        let tx = self.tx.as_ref().expect("notify on closed pipe end");
        write(tx, b"B").ctx("write(rendezvous)")?;
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        let rx = self.rx.as_ref().expect("wait on closed pipe end");
        let mut buf = [0u8; 1];
        let n = read(rx, &mut buf).ctx("read(rendezvous)")?;
        if n == 0 {
            // peer died with the write end open
            return Err(Error::ChildCrash);
        }
        Ok(())
    }
}

// the construction protocol uses one pipe per direction
pub struct Rendezvous {
    pub to_child: Pipe,
    pub to_parent: Pipe,
}

impl Rendezvous {
    pub fn new() -> Result<Self> {
        Ok(Rendezvous {
            to_child: Pipe::new()?,
            to_parent: Pipe::new()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let pipe = Pipe::new().unwrap();
        pipe.notify().unwrap();
        pipe.wait().unwrap();
    }

    #[test]
    fn eof_reports_peer_death() {
        let mut pipe = Pipe::new().unwrap();
        pipe.drop_tx();
        assert!(matches!(pipe.wait(), Err(Error::ChildCrash)));
    }
}
