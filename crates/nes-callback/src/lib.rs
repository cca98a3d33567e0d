// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod callback;

pub use callback::{Callback, CallbackOwner, CallbackRef};
