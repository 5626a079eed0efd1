//! Per-table config persistence.
//!
//! A sibling text file next to the table's engine directory, one
//! `key=value` line per option. Sentinel values (`u64::MAX` for the numeric
//! options) mean "unset at this layer, fall through."
//! Precedence at open, per spec.md section 3: persisted file < process
//! default < request-provided options.

use std::collections::HashMap;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::engine::{Compression, TableOptions};
use crate::error::AdminError;
use crate::merge_ops::MergeOperator;

/// Sentinel meaning "not set at this layer" for the numeric fields.
pub const UNSET: u64 = u64::MAX;

/// One layer of (possibly partial) table options, as read from a config
/// file or a request's string map. `None` means the field wasn't present.
#[derive(Debug, Clone, Default)]
pub struct PartialTableOptions {
    pub lru_cache_size: Option<u64>,
    pub table_block_size: Option<u64>,
    pub write_buffer_size: Option<u64>,
    pub bloom_filter_bits_per_key: Option<u64>,
    pub compression: Option<Compression>,
    pub merge_operator_code: Option<String>,
}

impl PartialTableOptions {
    /// Parses a request's `OpenTable` string-map options (the same key
    /// names used in the on-disk config file).
    pub fn from_string_map(map: &HashMap<String, String>) -> PartialTableOptions {
        PartialTableOptions {
            lru_cache_size: map.get("lruCacheSize").and_then(|v| v.parse().ok()),
            table_block_size: map.get("tableBlockSize").and_then(|v| v.parse().ok()),
            write_buffer_size: map.get("writeBufferSize").and_then(|v| v.parse().ok()),
            bloom_filter_bits_per_key: map
                .get("bloomFilterBitsPerKey")
                .and_then(|v| v.parse().ok()),
            compression: map.get("compression").map(|v| parse_compression(v)),
            merge_operator_code: map.get("mergeOperator").cloned(),
        }
    }

    /// `self` wins over `base` field by field.
    fn layer_over(self, base: PartialTableOptions) -> PartialTableOptions {
        PartialTableOptions {
            lru_cache_size: self.lru_cache_size.or(base.lru_cache_size),
            table_block_size: self.table_block_size.or(base.table_block_size),
            write_buffer_size: self.write_buffer_size.or(base.write_buffer_size),
            bloom_filter_bits_per_key: self
                .bloom_filter_bits_per_key
                .or(base.bloom_filter_bits_per_key),
            compression: self.compression.or(base.compression),
            merge_operator_code: self.merge_operator_code.or(base.merge_operator_code),
        }
    }

    fn resolve(self, process_default: &TableOptions) -> TableOptions {
        TableOptions {
            lru_cache_size: self.lru_cache_size.unwrap_or(process_default.lru_cache_size),
            table_block_size: self
                .table_block_size
                .unwrap_or(process_default.table_block_size),
            write_buffer_size: self
                .write_buffer_size
                .unwrap_or(process_default.write_buffer_size),
            bloom_filter_bits_per_key: self
                .bloom_filter_bits_per_key
                .unwrap_or(process_default.bloom_filter_bits_per_key),
            compression: self.compression.unwrap_or(process_default.compression),
            merge_operator_code: self
                .merge_operator_code
                .map(|code| MergeOperator::from_code(&code) as u8)
                .unwrap_or(process_default.merge_operator_code),
        }
    }
}

fn parse_compression(raw: &str) -> Compression {
    match raw.to_ascii_uppercase().as_str() {
        "ZLIB" => Compression::Zlib,
        "BZIP2" => Compression::Bzip2,
        "SNAPPY" => Compression::Snappy,
        _ => Compression::None,
    }
}

fn compression_code(c: Compression) -> &'static str {
    match c {
        Compression::None => "",
        Compression::Zlib => "ZLIB",
        Compression::Bzip2 => "BZIP2",
        Compression::Snappy => "SNAPPY",
    }
}

/// Resolves final `TableOptions` for an `OpenTable` request: persisted file
/// (if any) < process default < request-provided options, then persists the
/// resolved values back to the config file so future opens see them without
/// the request repeating them.
pub async fn resolve_and_persist(
    config_path: &Path,
    request: PartialTableOptions,
    process_default: &TableOptions,
) -> Result<TableOptions, AdminError> {
    let persisted = read_table_config_file(config_path).await?;
    let merged = request.layer_over(persisted);
    let resolved = merged.resolve(process_default);
    write_table_config_file(config_path, &resolved).await?;
    Ok(resolved)
}

async fn read_table_config_file(path: &Path) -> Result<PartialTableOptions, AdminError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PartialTableOptions::default()),
        Err(e) => return Err(AdminError::Io(e)),
    };
    let mut lines = BufReader::new(file).lines();
    let mut partial = PartialTableOptions::default();
    while let Some(line) = lines.next_line().await? {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "lruCacheSize" => partial.lru_cache_size = value.parse().ok(),
            "tableBlockSize" => partial.table_block_size = value.parse().ok(),
            "writeBufferSize" => partial.write_buffer_size = value.parse().ok(),
            "bloomFilterBitsPerKey" => partial.bloom_filter_bits_per_key = value.parse().ok(),
            "compression" => partial.compression = Some(parse_compression(value)),
            "mergeOperator" => partial.merge_operator_code = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(partial)
}

async fn write_table_config_file(path: &Path, options: &TableOptions) -> Result<(), AdminError> {
    let contents = format!(
        "lruCacheSize={}\ntableBlockSize={}\nwriteBufferSize={}\nbloomFilterBitsPerKey={}\ncompression={}\nmergeOperator={}\n",
        options.lru_cache_size,
        options.table_block_size,
        options.write_buffer_size,
        options.bloom_filter_bits_per_key,
        compression_code(options.compression),
        MergeOperator::from_repr(options.merge_operator_code).code(),
    );
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    Ok(())
}
