//! Snapshot image messages.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ThreadEntry {
    #[prost(int32, tag = "1")]
    pub tid: i32,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VmaEntry {
    #[prost(uint64, tag = "1")]
    pub start: u64,
    #[prost(uint64, tag = "2")]
    pub end: u64,
    #[prost(uint32, tag = "3")]
    pub prot: u32,
    #[prost(bool, tag = "4")]
    pub shared: bool,
    #[prost(uint64, tag = "5")]
    pub offset: u64,
    #[prost(string, tag = "6")]
    pub path: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessEntry {
    #[prost(int32, tag = "1")]
    pub pid: i32,
    #[prost(int32, tag = "2")]
    pub ppid: i32,
    #[prost(string, tag = "3")]
    pub comm: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub threads: ::prost::alloc::vec::Vec<ThreadEntry>,
    #[prost(message, repeated, tag = "5")]
    pub vmas: ::prost::alloc::vec::Vec<VmaEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForwardEntry {
    #[prost(int32, tag = "1")]
    pub scope: i32,
    #[prost(int32, tag = "2")]
    pub target: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotEntry {
    #[prost(int32, tag = "1")]
    pub requester: i32,
    #[prost(int32, tag = "2")]
    pub target: i32,
    #[prost(int32, tag = "3")]
    pub scope: i32,
    #[prost(string, tag = "4")]
    pub cwd: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub taken_at: u64,
    #[prost(message, repeated, tag = "6")]
    pub processes: ::prost::alloc::vec::Vec<ProcessEntry>,
    #[prost(message, repeated, tag = "7")]
    pub forwarded: ::prost::alloc::vec::Vec<ForwardEntry>,
}
