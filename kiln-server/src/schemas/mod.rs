//! Request/response DTOs shared between handlers and the OpenAPI document.

pub mod task;
