// Copyright 2025 Oxide Computer Company

/*
 * Control plane of the hoard storage-pooling daemon.
 *
 * The pool is a set of ordinary mounted filesystems.  File copies are
 * placed on drives drafted by the selection policy; a periodic health
 * cycle verifies that every drive we think we own is still the volume
 * we registered, and schedules consistency repair when drives disappear
 * or come back.  The byte-moving side (the Samba VFS plumbing and the
 * task executor) lives elsewhere and only meets us at the task queue.
 */

pub mod health;
pub mod notify;
pub mod ownership;
pub mod registry;
pub mod repair;
pub mod selection;
pub mod space;
pub mod tasks;
