use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    /// Parses the `<topic>-<partition>` form produced by [`TopicPartition::id`].
    /// Topic names may themselves contain dashes, so the split is on the last one.
    pub fn from_string(str_name: Cow<str>) -> AppResult<Self> {
        let (topic, partition) = str_name.rsplit_once('-').ok_or_else(|| {
            AppError::InvalidValue(format!("topic partition name: {}", str_name))
        })?;

        let partition = partition.parse().map_err(|_| {
            AppError::InvalidValue(format!("topic partition id: {}", partition))
        })?;

        Ok(Self::new(topic, partition))
    }
}
