// Persisted state messages (splitproc.img payload)
//
// Field tags are part of the on-disk format; never renumber.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateImage {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, repeated, tag = "2")]
    pub handles: ::prost::alloc::vec::Vec<HandleEntry>,
    /// Next serial per category, indexed by `Category::index()`.
    #[prost(uint32, repeated, tag = "3")]
    pub next_serials: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint64, tag = "4")]
    pub next_seq: u64,
    #[prost(message, repeated, tag = "5")]
    pub records: ::prost::alloc::vec::Vec<RecordEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandleEntry {
    #[prost(uint32, tag = "1")]
    pub handle: u32,
    #[prost(bool, tag = "2")]
    pub tombstoned: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordEntry {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(uint32, tag = "2")]
    pub category: u32,
    #[prost(string, tag = "3")]
    pub op: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub args: ::prost::alloc::vec::Vec<ArgEntry>,
    #[prost(uint32, optional, tag = "5")]
    pub output: ::core::option::Option<u32>,
    #[prost(bool, tag = "6")]
    pub collective: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ArgEntry {
    #[prost(oneof = "arg_entry::Value", tags = "1, 2, 3")]
    pub value: ::core::option::Option<arg_entry::Value>,
}

pub mod arg_entry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        Int(i64),
        #[prost(uint32, tag = "2")]
        Handle(u32),
        #[prost(bytes = "vec", tag = "3")]
        Buf(::prost::alloc::vec::Vec<u8>),
    }
}
