//! Smart protocol service subprocesses.

use std::io;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::str::FromStr;

use thiserror::Error;

use crate::storage::Repository;

#[derive(Error, Debug)]
#[error("unknown git service '{0}'")]
pub struct UnknownService(String);

/// A smart protocol service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Wire name, as in `service=git-upload-pack`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn subcommand(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            other => Err(UnknownService(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn command(repo: &Repository, service: Service, protocol: Option<&str>) -> Command {
    let mut cmd = Command::new("git");

    cmd.current_dir(&repo.path)
        .env_clear()
        .envs(std::env::vars().filter(|(key, _)| {
            key == "PATH" || key == "GNUPGHOME" || key.starts_with("GIT_TRACE")
        }))
        .stdout(Stdio::piped())
        .stdin(Stdio::piped())
        .stderr(Stdio::inherit());

    if let Some(protocol) = protocol {
        cmd.env("GIT_PROTOCOL", protocol);
    }
    cmd.arg(service.subcommand()).arg("--stateless-rpc");
    cmd
}

/// Produce the reference advertisement for `GET /info/refs`.
pub fn advertise(
    repo: &Repository,
    service: Service,
    protocol: Option<&str>,
) -> io::Result<Vec<u8>> {
    let mut cmd = command(repo, service, protocol);
    cmd.arg("--advertise-refs").arg(".");

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr),
        ));
    }
    Ok(output.stdout)
}

/// A running service subprocess.
///
/// `git receive-pack --stateless-rpc` only commits the received objects
/// to disk once its client starts consuming output: the unpack happens
/// before the first status line is written, so nothing is durable until
/// a reader pulls on stdout. [`Session::first_byte`] reads exactly one
/// byte and hands it back to the caller to prepend when draining. Before
/// that first read, [`Session::cancel`] aborts the push with no disk
/// effects; after it, the objects are on disk and must be reverted
/// explicitly.
pub struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl Session {
    /// Spawn a service for the given repository.
    pub fn spawn(
        repo: &Repository,
        service: Service,
        protocol: Option<&str>,
    ) -> io::Result<Self> {
        let mut cmd = command(repo, service, protocol);
        cmd.arg(".");

        let mut child = cmd.spawn()?;
        // Both handles were requested as pipes above.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdout was not captured")
        })?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }

    /// Copy the request body into the child's stdin and close it.
    /// Returns the number of bytes written.
    pub fn request<R: Read + ?Sized>(&mut self, body: &mut R) -> io::Result<u64> {
        let mut stdin = self.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "request body already written")
        })?;
        let n = match io::copy(body, &mut stdin) {
            Ok(n) => n,
            // The service may reject the request without reading all of
            // it; its verdict is on stdout.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => 0,
            Err(e) => return Err(e),
        };
        // Dropping the handle closes the pipe, signalling end of input.
        drop(stdin);

        Ok(n)
    }

    /// Read one byte of the child's output, making the received objects
    /// durable. The byte must be handed to [`Session::finish`] so the
    /// client sees an intact stream.
    pub fn first_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];

        match self.stdout.read_exact(&mut byte) {
            Ok(()) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Abort the service before any output was consumed. The push is
    /// discarded by git without touching the object database.
    pub fn cancel(mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // The child may have bailed out on its own already.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;

        Ok(())
    }

    /// Drain the remaining output to the client, prepending the unread
    /// byte, and reap the child.
    pub fn finish<W: Write + ?Sized>(
        mut self,
        first: Option<u8>,
        out: &mut W,
    ) -> io::Result<ExitStatus> {
        if let Some(byte) = first {
            out.write_all(&[byte])?;
        }
        io::copy(&mut self.stdout, out)?;

        self.child.wait()
    }
}

/// Run a service to completion: request in, response out. Used for
/// `upload-pack`, where no interception is needed.
pub fn serve<R, W>(
    repo: &Repository,
    service: Service,
    protocol: Option<&str>,
    body: &mut R,
    out: &mut W,
) -> io::Result<ExitStatus>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut session = Session::spawn(repo, service, protocol)?;
    session.request(body)?;
    session.finish(None, out)
}
