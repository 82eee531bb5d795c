use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use crate::message::TopicPartition;
use crate::AppError::InvalidValue;
use crate::AppResult;

/// Committed offsets of one consumer group, one `<topic>-<partition> <offset>`
/// line per partition after a version line.
#[derive(Debug, Clone)]
pub struct CheckPointFile {
    file_name: PathBuf,
    version: i8,
}

impl CheckPointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;
    pub const FILE_SUFFIX: &'static str = "checkpoint";

    pub fn new(file_name: impl AsRef<Path>) -> Self {
        Self {
            file_name: file_name.as_ref().to_path_buf(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    pub fn for_group(dir: impl AsRef<Path>, group_id: &str) -> Self {
        Self::new(
            dir.as_ref()
                .join(format!("{}.{}", group_id, Self::FILE_SUFFIX)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.file_name
    }

    /// Writes to a sibling temp file, syncs it, then renames over the old
    /// checkpoint so a crash never leaves a half written file behind.
    pub async fn write_checkpoints(&self, points: &BTreeMap<TopicPartition, i64>) -> AppResult<()> {
        let tmp_name = self.file_name.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_name)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        for (topic_partition, offset) in points {
            buf_writer
                .write_all(format!("{} {}\n", topic_partition.id(), offset).as_bytes())
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        tokio::fs::rename(&tmp_name, &self.file_name).await?;
        Ok(())
    }

    pub async fn read_checkpoints(&self) -> AppResult<BTreeMap<TopicPartition, i64>> {
        let error = |line: String| InvalidValue(format!("checkpoint line: {}", line.trim_end()));
        trace!("read checkpoints from {}", self.file_name.display());
        let open_file = OpenOptions::new().read(true).open(&self.file_name).await;
        let Ok(open_file) = open_file else {
            warn!(
                "checkpoint file {} cannot be found; if this is the first run of the group, please disregard this.",
                self.file_name.display()
            );
            return Ok(BTreeMap::new());
        };

        let mut reader = BufReader::new(open_file);
        let mut line_buffer = String::new();
        reader.read_line(&mut line_buffer).await?;
        let version = line_buffer.trim().parse::<i8>()?;
        if version != self.version {
            return Err(InvalidValue(format!("checkpoint version {}", version)));
        }
        let mut points = BTreeMap::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await? > 0 {
            let mut parts = line.split_whitespace();
            let (Some(tp_str), Some(offset), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(error(line));
            };
            let topic_partition = TopicPartition::from_string(Cow::Borrowed(tp_str))?;
            let offset = offset.parse().map_err(|_| error(line.clone()))?;
            points.insert(topic_partition, offset);
            line.clear();
        }
        Ok(points)
    }
}
