//! SFTP subsystem backed by the sandbox filesystem.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use russh::Channel;
use russh::server::Msg;
use russh_sftp::protocol::Attrs;
use russh_sftp::protocol::Data;
use russh_sftp::protocol::File;
use russh_sftp::protocol::FileAttributes;
use russh_sftp::protocol::Handle;
use russh_sftp::protocol::Name;
use russh_sftp::protocol::OpenFlags;
use russh_sftp::protocol::Status;
use russh_sftp::protocol::StatusCode;
use russh_sftp::protocol::Version;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::error;

/// Runs the SFTP server over the channel. Errors other than a clean EOF are
/// logged and end only this subsystem, not the SSH connection.
pub(crate) async fn serve(channel: Channel<Msg>, sid: &str) {
    let session = SftpSession::new(sid.to_string());
    russh_sftp::server::run(channel.into_stream(), session).await;
    debug!(session = %sid, "sftp subsystem finished");
}

enum OpenHandle {
    File(tokio::fs::File),
    Dir {
        entries: Vec<(String, FileAttributes)>,
        consumed: bool,
    },
}

pub(crate) struct SftpSession {
    sid: String,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpSession {
    fn new(sid: String) -> Self {
        Self {
            sid,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn allocate_handle(&mut self, open: OpenHandle) -> String {
        let handle = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle.clone(), open);
        handle
    }

    fn ok_status(&self, id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

fn status_for(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn attributes(metadata: &std::fs::Metadata) -> FileAttributes {
    FileAttributes::from(metadata)
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(session = %self.sid, version, "sftp init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE));
        if pflags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        }

        let file = options.open(&filename).await.map_err(|err| {
            debug!(session = %self.sid, file = %filename, error = %err, "sftp open failed");
            status_for(&err)
        })?;
        Ok(Handle {
            id,
            handle: self.allocate_handle(OpenHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(self.ok_status(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let Some(OpenHandle::File(file)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::NoSuchFile);
        };
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| status_for(&err))?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|err| status_for(&err))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let Some(OpenHandle::File(file)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::NoSuchFile);
        };
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| status_for(&err))?;
        file.write_all(&data)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(self.ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(Attrs {
            id,
            attrs: attributes(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let Some(OpenHandle::File(file)) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::NoSuchFile);
        };
        let metadata = file.metadata().await.map_err(|err| status_for(&err))?;
        Ok(Attrs {
            id,
            attrs: attributes(&metadata),
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| status_for(&err))?;

        let mut entries = vec![
            (".".to_string(), FileAttributes::default()),
            ("..".to_string(), FileAttributes::default()),
        ];
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = entry
                .metadata()
                .await
                .map(|metadata| attributes(&metadata))
                .unwrap_or_default();
            entries.push((name, attrs));
        }

        Ok(Handle {
            id,
            handle: self.allocate_handle(OpenHandle::Dir {
                entries,
                consumed: false,
            }),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let Some(OpenHandle::Dir { entries, consumed }) = self.handles.get_mut(&handle) else {
            return Err(StatusCode::NoSuchFile);
        };
        // One batch per directory; the second call signals the end.
        if *consumed {
            return Err(StatusCode::Eof);
        }
        *consumed = true;
        let files = entries
            .drain(..)
            .map(|(name, attrs)| File::new(name, attrs))
            .collect();
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(&filename)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(self.ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(&path)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(self.ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(self.ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = normalize_path(Path::new(&path));
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.to_string_lossy().into_owned())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(Attrs {
            id,
            attrs: attributes(&metadata),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(&oldpath, &newpath)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(self.ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = tokio::fs::read_link(&path)
            .await
            .map_err(|err| status_for(&err))?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy().into_owned())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::symlink(&targetpath, &linkpath)
            .await
            .map_err(|err| {
                error!(session = %self.sid, error = %err, "sftp symlink failed");
                status_for(&err)
            })?;
        Ok(self.ok_status(id))
    }
}

/// Lexical absolute-path cleanup: SFTP realpath must not require the target
/// to exist.
fn normalize_path(path: &Path) -> PathBuf {
    let mut base = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                base.pop();
            }
            std::path::Component::CurDir | std::path::Component::RootDir => {}
            other => base.push(other.as_os_str()),
        }
    }
    if base.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/../..")), PathBuf::from("/"));
    }
}
