// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core data-model types shared across the NebulaStream runtime: identifiers, field
//! values, schemas and the row/columnar memory layouts used to address them.

mod ids;
mod layout;
mod record;
mod schema;
mod value;

pub use ids::*;
pub use layout::*;
pub use record::*;
pub use schema::*;
pub use value::*;
