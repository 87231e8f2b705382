// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// Boolean config values spelled the way they travel in YAML ("Yes"/"No").
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YesNo {
    #[serde(rename = "Yes")]
    Yes,
    #[default]
    #[serde(rename = "No")]
    No,
}

impl YesNo {
    #[inline]
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
