// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use thiserror::Error;

#[derive(Error, Debug)]
/// Possible errors returned by the top-level API
pub enum SegError {
    #[error("item of {size} bytes does not fit in a segment")]
    ItemOversized { size: usize },
    #[error("key length must be between 1 and 255 bytes")]
    KeyLength,
    #[error("no free segments and none could be reclaimed")]
    NoFreeSegments,
    #[error("hash table insert exception")]
    HashTableInsertEx,
    #[error("item not found")]
    NotFound,
    #[error("item exists with a different version")]
    Exists,
    #[error("datapool error: {0}")]
    Datapool(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
