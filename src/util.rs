use std::{
    ffi::OsString,
    io::{
        ErrorKind,
        Read,
    },
    path::{
        Path,
        PathBuf,
    },
};

// we can't use Read::read_exact() because the last fragment of a file is allowed to be short
pub fn read_fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,  // EOF
            Ok(n) => {
                filled += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(e) => {
                return Err(e);
            }
        }
    }

    Ok(filled)
}

/// The reassembled copy of `source` goes next to it, with ".restored" appended.
pub fn restored_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".restored");
    PathBuf::from(name)
}
