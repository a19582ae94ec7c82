//! Append-only block storage: `blkNNNNN.dat` and `undoNNNNN.dat` files.
//!
//! Each stored item is a little-endian u32 length followed by the raw bytes.
//! Files roll over once they pass [`MAX_FILE_BYTES`]; positions are stable
//! once returned.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::Mutex,
};

use bytes::Bytes;
use quagga_chain::{BchDeserialize, BchSerialize};

use crate::undo::UndoBlock;
use crate::BoxError;

/// Roll over to a new file once the current one passes this size.
const MAX_FILE_BYTES: u64 = 128 * 1024 * 1024;

/// A position inside the block file set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FilePos {
    /// The file number (the `NNNNN` in `blkNNNNN.dat`).
    pub file: u32,
    /// Byte offset of the item's length prefix within the file.
    pub offset: u32,
}

struct Cursor {
    file: u32,
    len: u64,
}

/// The on-disk block and undo files for one network.
pub struct BlockFiles {
    dir: PathBuf,
    block_cursor: Mutex<Cursor>,
    undo_cursor: Mutex<Cursor>,
}

impl BlockFiles {
    /// Open (creating if needed) the block file set under `dir`.
    pub fn open(dir: PathBuf) -> Result<BlockFiles, BoxError> {
        fs::create_dir_all(&dir)?;
        let block_cursor = Self::find_cursor(&dir, "blk")?;
        let undo_cursor = Self::find_cursor(&dir, "undo")?;
        Ok(BlockFiles {
            dir,
            block_cursor: Mutex::new(block_cursor),
            undo_cursor: Mutex::new(undo_cursor),
        })
    }

    fn find_cursor(dir: &PathBuf, prefix: &str) -> Result<Cursor, BoxError> {
        let mut file = 0u32;
        loop {
            let next = dir.join(format!("{}{:05}.dat", prefix, file + 1));
            if next.exists() {
                file += 1;
            } else {
                break;
            }
        }
        let current = dir.join(format!("{}{:05}.dat", prefix, file));
        let len = match fs::metadata(&current) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        Ok(Cursor { file, len })
    }

    fn path_for(&self, prefix: &str, file: u32) -> PathBuf {
        self.dir.join(format!("{}{:05}.dat", prefix, file))
    }

    fn append(&self, prefix: &str, cursor: &Mutex<Cursor>, bytes: &[u8]) -> io::Result<FilePos> {
        let mut cursor = cursor.lock().expect("block file cursor poisoned");
        if cursor.len + bytes.len() as u64 + 4 > MAX_FILE_BYTES && cursor.len > 0 {
            cursor.file += 1;
            cursor.len = 0;
        }
        let path = self.path_for(prefix, cursor.file);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let offset = cursor.len as u32;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        cursor.len += bytes.len() as u64 + 4;

        metrics::counter!("state.block_files.bytes.written", bytes.len() as u64 + 4);
        Ok(FilePos {
            file: cursor.file,
            offset,
        })
    }

    fn read(&self, prefix: &str, pos: FilePos) -> io::Result<Vec<u8>> {
        let mut file = File::open(self.path_for(prefix, pos.file))?;
        file.seek(SeekFrom::Start(pos.offset as u64))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Append a serialized block, returning where it landed.
    pub fn write_block(&self, bytes: &[u8]) -> io::Result<FilePos> {
        self.append("blk", &self.block_cursor, bytes)
    }

    /// Load a raw block previously written with [`write_block`].
    pub fn read_block(&self, pos: FilePos) -> io::Result<Bytes> {
        Ok(Bytes::from(self.read("blk", pos)?))
    }

    /// Append an undo block, returning where it landed.
    pub fn write_undo(&self, undo: &UndoBlock) -> Result<FilePos, BoxError> {
        let bytes = undo.bch_serialize_to_vec()?;
        Ok(self.append("undo", &self.undo_cursor, &bytes)?)
    }

    /// Load an undo block previously written with [`write_undo`].
    pub fn read_undo(&self, pos: FilePos) -> Result<UndoBlock, BoxError> {
        let bytes = self.read("undo", pos)?;
        Ok(UndoBlock::bch_deserialize(&bytes[..])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn blocks_round_trip_through_files() {
        quagga_test::init();

        let dir = TempDir::new("quagga-block-files").unwrap();
        let files = BlockFiles::open(dir.path().to_path_buf()).unwrap();

        let first = files.write_block(&quagga_test::vectors::DUMMY_BLOCK).unwrap();
        let second = files.write_block(b"second block bytes").unwrap();
        assert_eq!(first.file, second.file);
        assert!(second.offset > first.offset);

        assert_eq!(
            &files.read_block(first).unwrap()[..],
            &quagga_test::vectors::DUMMY_BLOCK[..]
        );
        assert_eq!(&files.read_block(second).unwrap()[..], b"second block bytes");
    }

    #[test]
    fn reopening_preserves_append_position() {
        quagga_test::init();

        let dir = TempDir::new("quagga-block-files").unwrap();
        let first = {
            let files = BlockFiles::open(dir.path().to_path_buf()).unwrap();
            files.write_block(b"one").unwrap()
        };

        let files = BlockFiles::open(dir.path().to_path_buf()).unwrap();
        let second = files.write_block(b"two").unwrap();
        assert_eq!(second.file, first.file);
        assert!(second.offset > first.offset);
        assert_eq!(&files.read_block(first).unwrap()[..], b"one");
        assert_eq!(&files.read_block(second).unwrap()[..], b"two");
    }
}
