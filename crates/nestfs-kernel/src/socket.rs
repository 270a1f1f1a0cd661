//! Sockets bind a controller to one entry name; streams move the bytes.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::address::{NodeName, NodePath};
use crate::controller::Controller;
use crate::entry::Entry;
use crate::error::{FsError, FsResult};

/// Byte source returned by [`InputSocket::stream`].
pub trait ReadStream: Read + Send {
    /// Closes the stream, releasing whatever it holds.
    fn close(self: Box<Self>) -> FsResult<()>;
}

/// Byte sink returned by [`OutputSocket::stream`].
///
/// Written bytes are committed by [`WriteStream::close`]. Dropping the stream
/// without closing it discards them.
pub trait WriteStream: Write + Send {
    /// Commits the written bytes and closes the stream.
    fn close(self: Box<Self>) -> FsResult<()>;
}

/// A [`ReadStream`] over any reader that needs no cleanup.
pub struct ReaderStream<R> {
    reader: R,
}

impl<R: Read + Send> ReaderStream<R> {
    /// Wraps `reader`.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> Read for ReaderStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R: Read + Send> ReadStream for ReaderStream<R> {
    fn close(self: Box<Self>) -> FsResult<()> {
        Ok(())
    }
}

/// Renders `name` inside `controller`'s mount point for error messages.
pub(crate) fn display_path(controller: &dyn Controller, name: &NodeName) -> String {
    format!("{}{}", controller.mount_point(), name)
}

/// Read binding of one controller and entry name.
///
/// Opening the stream consumes the socket, so each socket yields at most one
/// stream. Clone the socket first to open another.
#[derive(Clone)]
pub struct InputSocket {
    controller: Arc<dyn Controller>,
    name: NodeName,
}

impl InputSocket {
    /// Binds `name` inside `controller`.
    pub fn new(controller: Arc<dyn Controller>, name: NodeName) -> Self {
        Self { controller, name }
    }

    /// The bound entry name.
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// The full address of the bound entry.
    pub fn path(&self) -> FsResult<NodePath> {
        self.controller.mount_point().resolve(&self.name)
    }

    /// The entry the stream would read.
    pub fn target(&self) -> FsResult<Entry> {
        self.controller
            .entry(&self.name)?
            .ok_or_else(|| FsError::not_found(display_path(self.controller.as_ref(), &self.name)))
    }

    /// Opens the stream.
    pub fn stream(self) -> FsResult<Box<dyn ReadStream>> {
        self.controller.open_input(&self.name)
    }

    /// Reads the whole entry into memory.
    pub fn read_all(self) -> FsResult<Vec<u8>> {
        let mut stream = self.stream()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        stream.close()?;
        Ok(data)
    }
}

impl fmt::Debug for InputSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSocket")
            .field("mount_point", self.controller.mount_point())
            .field("name", &self.name)
            .finish()
    }
}

/// Write binding of one controller and entry name, with an optional template
/// whose timestamps the written entry takes over.
#[derive(Clone)]
pub struct OutputSocket {
    controller: Arc<dyn Controller>,
    name: NodeName,
    template: Option<Entry>,
}

impl OutputSocket {
    /// Binds `name` inside `controller`.
    pub fn new(controller: Arc<dyn Controller>, name: NodeName, template: Option<Entry>) -> Self {
        Self {
            controller,
            name,
            template,
        }
    }

    /// The same binding with another template.
    pub fn with_template(mut self, template: Option<Entry>) -> Self {
        self.template = template;
        self
    }

    /// The bound entry name.
    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// The template, if any.
    pub fn template(&self) -> Option<&Entry> {
        self.template.as_ref()
    }

    /// The full address of the bound entry.
    pub fn path(&self) -> FsResult<NodePath> {
        self.controller.mount_point().resolve(&self.name)
    }

    /// The entry as it will look once written: the existing entry, or a new
    /// file entry, with the template's timestamps applied.
    pub fn target(&self) -> FsResult<Entry> {
        let mut entry = match self.controller.entry(&self.name)? {
            Some(existing) => existing,
            None => Entry::file(self.name.as_str()),
        };
        if let Some(template) = &self.template {
            entry.apply_times(template);
        }
        Ok(entry)
    }

    /// Opens the stream.
    pub fn stream(self) -> FsResult<Box<dyn WriteStream>> {
        self.controller.open_output(&self.name, self.template.as_ref())
    }

    /// Replaces the entry content with `data`.
    pub fn write_all(self, data: &[u8]) -> FsResult<()> {
        let mut stream = self.stream()?;
        stream.write_all(data)?;
        stream.close()
    }
}

impl fmt::Debug for OutputSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSocket")
            .field("mount_point", self.controller.mount_point())
            .field("name", &self.name)
            .field("template", &self.template)
            .finish()
    }
}

/// Copies everything from `input` to `output`, closing both.
///
/// Returns the number of bytes copied. The output is only committed if the
/// whole copy succeeded.
pub fn copy(input: InputSocket, output: OutputSocket) -> FsResult<u64> {
    let mut source = input.stream()?;
    let mut sink = output.stream()?;
    let copied = io::copy(&mut source, &mut sink)?;
    source.close()?;
    sink.close()?;
    Ok(copied)
}
