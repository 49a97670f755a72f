// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::command::Command;
use crate::errors::{Error, Result, Status};
use crate::sink::{OutputSink, lock_sink};
use crate::ssh::{CHUNK_SIZE, SshTarget};
use crate::io::InputStream;

/// One queued interrupt: the event loop writes the control byte and reports
/// the write's outcome back through the sender.
type InterruptReply = oneshot::Sender<Result<()>>;

/// Single-slot registry for the command eligible to receive interrupts.
/// At most one foreground transaction exists per target at any time.
#[derive(Default)]
pub(crate) struct ForegroundSlot(Mutex<Option<Foreground>>);

pub(crate) struct Foreground {
    interrupt_tx: mpsc::UnboundedSender<InterruptReply>,
    use_tty: Arc<AtomicBool>,
    eof_sent: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl ForegroundSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Foreground>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, foreground: Foreground) -> Result<ForegroundGuard<'_>> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(Error::OpenSession);
        }
        *slot = Some(foreground);
        Ok(ForegroundGuard(self))
    }
}

/// Clears the foreground slot on every exit path of the transaction.
struct ForegroundGuard<'a>(&'a ForegroundSlot);

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Forwards a controller interrupt to the foreground command.
///
/// With a PTY the interrupt travels as a literal Ctrl-C byte on the channel;
/// the event loop performs the write and its outcome is awaited here, so a
/// failed write surfaces to the caller. Without a PTY there is nothing the
/// peer SSH implementation reliably delivers, so only the `interrupted` flag
/// is recorded.
pub(crate) async fn interrupt(slot: &ForegroundSlot) -> Result<()> {
    // The slot lock is not held across the wait for delivery.
    let interrupt_tx = {
        let guard = slot.lock();
        let Some(foreground) = guard.as_ref() else {
            return Err(Error::OpenSession);
        };
        if foreground.use_tty.load(Ordering::Relaxed) {
            if foreground.eof_sent.load(Ordering::Relaxed) {
                log::debug!("cannot send Ctrl-C, channel is already closed for writing");
                return Err(Error::InterruptCommand);
            }
            foreground.interrupt_tx.clone()
        } else {
            log::debug!("command is not running in a tty, recording the interrupt instead");
            foreground.interrupted.store(true, Ordering::Relaxed);
            return Ok(());
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    interrupt_tx
        .send(reply_tx)
        .map_err(|_| Error::InterruptCommand)?;
    // A dropped reply means the transaction tore down before delivering.
    reply_rx.await.unwrap_or(Err(Error::InterruptCommand))
}

/// Runs one command transaction against the target: open a session and
/// channel from the template, optionally request a PTY, issue the command,
/// pump the event loop, capture the exit status, tear everything down.
pub(crate) async fn run(
    target: &SshTarget,
    cmd: Command,
    sink: &Mutex<OutputSink>,
) -> Result<Status> {
    if cmd.command.is_empty() {
        return Err(Error::Parameter);
    }
    // The deadline covers the whole transaction, connection setup included.
    let deadline = Instant::now() + cmd.timeout;

    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    let use_tty = Arc::new(AtomicBool::new(false));
    let eof_sent = Arc::new(AtomicBool::new(false));
    let _guard = target.foreground.register(Foreground {
        interrupt_tx,
        use_tty: use_tty.clone(),
        eof_sent: eof_sent.clone(),
        interrupted: Arc::new(AtomicBool::new(false)),
    })?;

    let session = target.template.open(cmd.user.as_deref()).await?;
    let result = run_with_session(&session, cmd, deadline, use_tty, eof_sent, interrupt_rx, sink).await;
    let _ = session
        .disconnect(russh::Disconnect::ByApplication, "", "")
        .await;
    result
}

async fn run_with_session(
    session: &russh::client::Handle<super::session::ClientHandler>,
    cmd: Command,
    deadline: Instant,
    use_tty: Arc<AtomicBool>,
    eof_sent: Arc<AtomicBool>,
    interrupt_rx: mpsc::UnboundedReceiver<InterruptReply>,
    sink: &Mutex<OutputSink>,
) -> Result<Status> {
    let mut channel = session.channel_open_session().await.map_err(|err| {
        log::debug!("channel open failed: {err}");
        Error::OpenSession
    })?;
    let outcome =
        drive_command(&mut channel, cmd, deadline, use_tty, eof_sent, interrupt_rx, sink).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
    outcome
}

async fn drive_command(
    channel: &mut Channel<Msg>,
    cmd: Command,
    deadline: Instant,
    use_tty: Arc<AtomicBool>,
    eof_sent: Arc<AtomicBool>,
    interrupt_rx: mpsc::UnboundedReceiver<InterruptReply>,
    sink: &Mutex<OutputSink>,
) -> Result<Status> {
    if cmd.request_tty {
        channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|err| {
                log::debug!("pty request refused: {err}");
                Error::OpenSession
            })?;
        use_tty.store(true, Ordering::Relaxed);
    }

    channel
        .exec(true, cmd.command.as_str())
        .await
        .map_err(|err| {
            log::debug!("exec request failed: {err}");
            Error::SendCommand
        })?;

    let mut transaction = Transaction {
        channel,
        stdin: cmd.stdin,
        stdin_eof: false,
        outputs_eof: false,
        deadline,
        use_tty: use_tty.load(Ordering::Relaxed),
        eof_sent,
        interrupt_rx,
        exit_status: None,
        exit_signal: None,
    };
    transaction.event_loop(sink).await
}

struct Transaction<'a> {
    channel: &'a mut Channel<Msg>,
    stdin: InputStream,
    stdin_eof: bool,
    outputs_eof: bool,
    deadline: Instant,
    use_tty: bool,
    eof_sent: Arc<AtomicBool>,
    interrupt_rx: mpsc::UnboundedReceiver<InterruptReply>,
    exit_status: Option<i32>,
    exit_signal: Option<i32>,
}

enum Event {
    Channel(Option<ChannelMsg>),
    Stdin(io::Result<usize>),
    Interrupt(InterruptReply),
    Deadline,
}

impl Transaction<'_> {
    /// Multiplexes remote output, local stdin, interrupts and the deadline
    /// until the remote side stops producing output, then captures the exit
    /// status.
    async fn event_loop(&mut self, sink: &Mutex<OutputSink>) -> Result<Status> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        while !self.outputs_eof {
            let event = tokio::select! {
                msg = self.channel.wait() => Event::Channel(msg),
                read = self.stdin.read(&mut buf), if !self.stdin_eof => Event::Stdin(read),
                Some(reply) = self.interrupt_rx.recv() => Event::Interrupt(reply),
                _ = sleep_until(self.deadline) => Event::Deadline,
            };
            match event {
                Event::Channel(None) => {
                    // The message stream ended without an EOF or a close;
                    // the transport underneath went away.
                    log::debug!("channel torn down mid-transaction");
                    return Err(Error::ReceiveResults);
                }
                Event::Channel(Some(msg)) => self.handle_message(msg, sink)?,
                Event::Stdin(Ok(0)) => self.mark_stdin_eof().await?,
                Event::Stdin(Ok(n)) => {
                    if let Err(err) = self.channel.data(&buf[..n]).await {
                        log::debug!("forwarding stdin to the remote command failed: {err}");
                        return Err(Error::ForwardInput);
                    }
                }
                Event::Stdin(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Event::Stdin(Err(err)) => {
                    log::debug!("reading local stdin failed: {err}");
                    return Err(Error::ForwardInput);
                }
                Event::Interrupt(reply) => self.deliver_interrupt(reply).await,
                Event::Deadline => return Err(Error::CommandTimeout),
            }
        }
        self.collect_status().await
    }

    fn handle_message(&mut self, msg: ChannelMsg, sink: &Mutex<OutputSink>) -> Result<()> {
        match msg {
            ChannelMsg::Data { data } => self.deliver_output(sink, false, &data),
            ChannelMsg::ExtendedData { data, ext: 1 } => self.deliver_output(sink, true, &data),
            ChannelMsg::Eof | ChannelMsg::Close => {
                self.outputs_eof = true;
                Ok(())
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_status = Some(exit_status as i32);
                Ok(())
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.exit_signal = Some(signal_number(&signal_name));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn deliver_output(&mut self, sink: &Mutex<OutputSink>, is_err: bool, data: &[u8]) -> Result<()> {
        if let Err(err) = lock_sink(sink).write(is_err, data) {
            log::debug!("delivering remote output failed: {err}");
            return Err(Error::ReceiveResults);
        }
        Ok(())
    }

    async fn mark_stdin_eof(&mut self) -> Result<()> {
        self.stdin_eof = true;
        self.send_channel_eof().await.map_err(|err| {
            log::debug!("sending EOF to the remote command failed: {err}");
            Error::ForwardInput
        })
    }

    /// Closes the write side exactly once. A PTY needs a literal Ctrl-D in
    /// the byte stream ahead of the channel-level EOF.
    async fn send_channel_eof(&mut self) -> std::result::Result<(), russh::Error> {
        if self.eof_sent.load(Ordering::Relaxed) {
            return Ok(());
        }
        if self.use_tty {
            self.channel.data(&b"\x04"[..]).await?;
        }
        self.channel.eof().await?;
        self.eof_sent.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the queued Ctrl-C on the channel and reports the outcome back
    /// to the interrupting caller.
    async fn deliver_interrupt(&mut self, reply: InterruptReply) {
        let outcome = if self.eof_sent.load(Ordering::Relaxed) {
            log::debug!("cannot send Ctrl-C, channel is already closed for writing");
            Err(Error::InterruptCommand)
        } else {
            interrupt_outcome(self.channel.data(&b"\x03"[..]).await)
        };
        let _ = reply.send(outcome);
    }

    /// Both output streams are done; make sure our EOF went out, then wait
    /// for the server to report how the command ended.
    async fn collect_status(&mut self) -> Result<Status> {
        self.send_channel_eof().await.map_err(|err| {
            log::debug!("closing the write side failed: {err}");
            Error::ReceiveResults
        })?;
        while self.exit_status.is_none() && self.exit_signal.is_none() {
            let msg = tokio::select! {
                msg = self.channel.wait() => msg,
                _ = sleep_until(self.deadline) => return Err(Error::CommandTimeout),
            };
            match msg {
                None | Some(ChannelMsg::Close) => break,
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit_status = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    self.exit_signal = Some(signal_number(&signal_name));
                }
                Some(_) => {}
            }
        }
        Ok(derive_status(self.exit_status, self.exit_signal))
    }
}

/// A short or failed Ctrl-C write is an interrupt error.
fn interrupt_outcome<E: std::fmt::Display>(write: std::result::Result<(), E>) -> Result<()> {
    match write {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("failed to deliver Ctrl-C to the remote command: {err}");
            Err(Error::InterruptCommand)
        }
    }
}

/// When a command dies from a signal the server reports no numeric exit
/// status at all, only the exit-signal name; that case wins over a missing
/// status.
fn derive_status(exit_status: Option<i32>, exit_signal: Option<i32>) -> Status {
    match exit_signal {
        Some(signo) => Status::signaled(signo),
        None => Status::exited(exit_status.unwrap_or(-1)),
    }
}

/// Maps an exit-signal name from the wire to the host's POSIX signal number.
/// Unknown names map to -1.
fn signal_number(sig: &Sig) -> i32 {
    match sig {
        Sig::HUP => libc::SIGHUP,
        Sig::INT => libc::SIGINT,
        Sig::QUIT => libc::SIGQUIT,
        Sig::ILL => libc::SIGILL,
        Sig::ABRT => libc::SIGABRT,
        Sig::FPE => libc::SIGFPE,
        Sig::KILL => libc::SIGKILL,
        Sig::USR1 => libc::SIGUSR1,
        Sig::SEGV => libc::SIGSEGV,
        Sig::PIPE => libc::SIGPIPE,
        Sig::ALRM => libc::SIGALRM,
        Sig::TERM => libc::SIGTERM,
        Sig::Custom(name) => custom_signal_number(name),
    }
}

fn custom_signal_number(name: &str) -> i32 {
    match name {
        "TRAP" => libc::SIGTRAP,
        "BUS" => libc::SIGBUS,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "URG" => libc::SIGURG,
        "XCPU" => libc::SIGXCPU,
        "XFSZ" => libc::SIGXFSZ,
        "VTALRM" => libc::SIGVTALRM,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "IO" => libc::SIGIO,
        "SYS" => libc::SIGSYS,
        #[cfg(target_os = "linux")]
        "IOT" => libc::SIGIOT,
        #[cfg(target_os = "linux")]
        "STKFLT" => libc::SIGSTKFLT,
        #[cfg(target_os = "linux")]
        "PWR" => libc::SIGPWR,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Foreground, ForegroundSlot, InterruptReply, derive_status, interrupt, interrupt_outcome,
        signal_number,
    };
    use crate::errors::{Error, Status};
    use russh::Sig;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn signal_names_map_to_posix_numbers() {
        assert_eq!(signal_number(&Sig::INT), libc::SIGINT);
        assert_eq!(signal_number(&Sig::TERM), libc::SIGTERM);
        assert_eq!(signal_number(&Sig::KILL), libc::SIGKILL);
        assert_eq!(signal_number(&Sig::Custom("CHLD".to_string())), libc::SIGCHLD);
        assert_eq!(signal_number(&Sig::Custom("NOSUCH".to_string())), -1);
    }

    #[test]
    fn exit_signal_wins_over_missing_status() {
        assert_eq!(derive_status(Some(0), None), Status::exited(0));
        assert_eq!(derive_status(Some(42), None), Status::exited(42));
        assert_eq!(derive_status(None, Some(15)), Status::signaled(15));
        assert_eq!(derive_status(None, None), Status::exited(-1));
    }

    fn foreground(
        use_tty: bool,
        eof_sent: bool,
    ) -> (Foreground, mpsc::UnboundedReceiver<InterruptReply>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interrupted = Arc::new(AtomicBool::new(false));
        let fg = Foreground {
            interrupt_tx: tx,
            use_tty: Arc::new(AtomicBool::new(use_tty)),
            eof_sent: Arc::new(AtomicBool::new(eof_sent)),
            interrupted: interrupted.clone(),
        };
        (fg, rx, interrupted)
    }

    #[test]
    fn slot_admits_a_single_foreground_transaction() {
        let slot = ForegroundSlot::default();
        let (first, _rx1, _) = foreground(false, false);
        let guard = slot.register(first).unwrap();

        let (second, _rx2, _) = foreground(false, false);
        assert_eq!(slot.register(second).err(), Some(Error::OpenSession));

        drop(guard);
        let (third, _rx3, _) = foreground(false, false);
        assert!(slot.register(third).is_ok());
    }

    #[tokio::test]
    async fn interrupt_without_foreground_fails() {
        let slot = ForegroundSlot::default();
        assert_eq!(interrupt(&slot).await.unwrap_err(), Error::OpenSession);
    }

    #[tokio::test]
    async fn interrupt_with_tty_reports_a_delivered_control_byte() {
        let slot = ForegroundSlot::default();
        let (fg, mut rx, _) = foreground(true, false);
        let _guard = slot.register(fg).unwrap();

        let (outcome, ()) = tokio::join!(interrupt(&slot), async {
            let reply = rx.recv().await.unwrap();
            reply.send(Ok(())).unwrap();
        });
        assert_eq!(outcome, Ok(()));
    }

    #[tokio::test]
    async fn interrupt_write_failure_surfaces_to_the_caller() {
        let slot = ForegroundSlot::default();
        let (fg, mut rx, _) = foreground(true, false);
        let _guard = slot.register(fg).unwrap();

        // The event loop found the channel dead when it tried to write.
        let (outcome, ()) = tokio::join!(interrupt(&slot), async {
            let reply = rx.recv().await.unwrap();
            reply.send(Err(Error::InterruptCommand)).unwrap();
        });
        assert_eq!(outcome, Err(Error::InterruptCommand));
    }

    #[tokio::test]
    async fn interrupt_fails_when_the_transaction_goes_away() {
        let slot = ForegroundSlot::default();
        let (fg, mut rx, _) = foreground(true, false);
        let _guard = slot.register(fg).unwrap();

        // Teardown drops the queued request without answering it.
        let (outcome, ()) = tokio::join!(interrupt(&slot), async {
            let reply = rx.recv().await.unwrap();
            drop(reply);
        });
        assert_eq!(outcome, Err(Error::InterruptCommand));
    }

    #[tokio::test]
    async fn interrupt_on_half_closed_tty_fails() {
        let slot = ForegroundSlot::default();
        let (fg, _rx, _) = foreground(true, true);
        let _guard = slot.register(fg).unwrap();

        assert_eq!(interrupt(&slot).await.unwrap_err(), Error::InterruptCommand);
    }

    #[tokio::test]
    async fn interrupt_without_tty_only_sets_the_flag() {
        let slot = ForegroundSlot::default();
        let (fg, mut rx, interrupted) = foreground(false, false);
        let _guard = slot.register(fg).unwrap();

        interrupt(&slot).await.unwrap();
        assert!(interrupted.load(Ordering::Relaxed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn a_failed_control_byte_write_is_an_interrupt_error() {
        assert_eq!(interrupt_outcome::<&str>(Ok(())), Ok(()));
        assert_eq!(
            interrupt_outcome(Err("channel closed")),
            Err(Error::InterruptCommand)
        );
    }
}
