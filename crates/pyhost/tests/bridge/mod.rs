mod call;
mod common;
mod lifecycle;
mod marshal;
