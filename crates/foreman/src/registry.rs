// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod handle;
mod options;
mod surface;

pub use handle::*;
pub use options::*;
pub use surface::*;
