pub mod serde_dur;
