//! # salftp – FTP core
//!
//! Control/data connection engine, keep-alive, proxy traversal, listing cache
//! and the server-type listing parser.

pub mod ftp;
