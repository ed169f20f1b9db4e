use sha2::{Digest, Sha256};

fn digest_u64(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(head)
}

/// 键到分区的稳定映射 / Stable key-to-partition mapping
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    (digest_u64(&[key.as_bytes()]) % partitions as u64) as u32
}

/// HRW 一致性哈希选择 / HRW (rendezvous) selection
///
/// 成员增减只迁移属于该成员的键。
/// Adding or removing a candidate only moves the keys that candidate owns.
pub fn hrw_select<'a, I>(key: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .map(|c| (digest_u64(&[key.as_bytes(), b"/", c.as_bytes()]), c))
        .max()
        .map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["alice", "bob", "group-9"] {
            let p = partition_for(key, 16);
            assert!(p < 16);
            assert_eq!(p, partition_for(key, 16));
        }
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[test]
    fn hrw_moves_only_departed_members_keys() {
        let all = ["w1", "w2", "w3"];
        let remaining = ["w1", "w3"];
        for p in 0..64 {
            let key = format!("p{}", p);
            let before = hrw_select(&key, all.iter().copied()).unwrap();
            let after = hrw_select(&key, remaining.iter().copied()).unwrap();
            if before != "w2" {
                assert_eq!(before, after);
            }
        }
        assert!(hrw_select("k", std::iter::empty()).is_none());
    }
}
