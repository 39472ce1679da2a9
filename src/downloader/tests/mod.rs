use super::test_helpers::*;
use super::*;
use crate::types::{Event, QueueItemId, Status};
use std::time::Duration;

mod scheduler;
