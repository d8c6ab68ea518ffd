use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The download target: created once, pre-sized to the torrent length, and
/// filled with verified pieces at their absolute offsets.
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    pub fn create(dir: &Path, name: &str, total_length: u64) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        // Sparse pre-size so positional writes land inside the file.
        file.set_len(total_length)?;

        Ok(OutputFile { file, path })
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "remora-disk-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn positional_writes_land_at_offset() {
        let dir = scratch_dir("write");
        let mut out = OutputFile::create(&dir, "out.bin", 32).unwrap();

        out.write_at(16, b"tail").unwrap();
        out.write_at(0, b"head").unwrap();

        let mut buf = [0u8; 4];
        out.read_at(16, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
        out.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"head");

        assert_eq!(fs::metadata(out.path()).unwrap().len(), 32);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn create_presizes_the_file() {
        let dir = scratch_dir("presize");
        let out = OutputFile::create(&dir, "sized.bin", 4096).unwrap();
        assert_eq!(fs::metadata(out.path()).unwrap().len(), 4096);
        let _ = fs::remove_dir_all(&dir);
    }
}
