//! 成员快照

use tracing::warn;

use crate::discovery::instance::ServiceRecord;

/// 某一时刻监听前缀下的全部成员（原始字节，无序）
///
/// 快照总是整体替换，调用方不需要合并增量。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    members: Vec<Vec<u8>>,
}

impl MembershipSnapshot {
    pub fn new(members: Vec<Vec<u8>>) -> Self {
        Self { members }
    }

    /// 原始成员数据
    pub fn members(&self) -> &[Vec<u8>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// 解码全部成员
    ///
    /// 解码失败的成员被丢弃并记录日志，其余成员照常返回
    pub fn decode_records(&self) -> Vec<ServiceRecord> {
        self.members
            .iter()
            .filter_map(|raw| match ServiceRecord::decode(raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        error = %e,
                        payload = %String::from_utf8_lossy(raw),
                        "Dropping undecodable service record"
                    );
                    None
                }
            })
            .collect()
    }
}

impl From<Vec<Vec<u8>>> for MembershipSnapshot {
    fn from(members: Vec<Vec<u8>>) -> Self {
        Self::new(members)
    }
}
