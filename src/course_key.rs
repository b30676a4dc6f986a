use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

static RE_COURSE_V1: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^course-v1:([A-Za-z0-9._~-]+)\+([A-Za-z0-9._~-]+)\+([A-Za-z0-9._~-]+)$").unwrap()
});
static RE_CCX_V1: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ccx-v1:([A-Za-z0-9._~-]+)\+([A-Za-z0-9._~-]+)\+([A-Za-z0-9._~-]+)\+ccx@(\d+)$")
        .unwrap()
});
static RE_SLASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9._~-]+)/([A-Za-z0-9._~-]+)/([A-Za-z0-9._~-]+)$").unwrap()
});

/// Structured course identifier.
///
/// Supported input formats:
/// - `course-v1:ORG+COURSE+RUN`
/// - `ccx-v1:ORG+COURSE+RUN+ccx@N` (custom course on top of a master course)
/// - `ORG/COURSE/RUN` (legacy slash-separated keys)
///
/// Display yields the form the key was parsed from. A legacy slash key and a
/// `course-v1:` key with the same parts name different courses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourseKey {
    pub org: String,
    pub course: String,
    pub run: String,
    pub ccx: Option<u32>,
    /// Parsed from the legacy `ORG/COURSE/RUN` form.
    pub deprecated: bool,
}

impl CourseKey {
    pub fn new(org: &str, course: &str, run: &str) -> Self {
        Self {
            org: org.to_string(),
            course: course.to_string(),
            run: run.to_string(),
            ccx: None,
            deprecated: false,
        }
    }

    /// A legacy slash-separated key.
    pub fn legacy(org: &str, course: &str, run: &str) -> Self {
        Self {
            deprecated: true,
            ..Self::new(org, course, run)
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if let Some(caps) = RE_CCX_V1.captures(s) {
            let ccx = caps[4]
                .parse::<u32>()
                .map_err(|_| Error::InvalidCourseKey(input.to_string()))?;
            return Ok(Self {
                ccx: Some(ccx),
                ..Self::new(&caps[1], &caps[2], &caps[3])
            });
        }
        if let Some(caps) = RE_COURSE_V1.captures(s) {
            return Ok(Self::new(&caps[1], &caps[2], &caps[3]));
        }
        if let Some(caps) = RE_SLASH.captures(s) {
            return Ok(Self::legacy(&caps[1], &caps[2], &caps[3]));
        }
        Err(Error::InvalidCourseKey(input.to_string()))
    }

    pub fn is_ccx(&self) -> bool {
        self.ccx.is_some()
    }

    /// The master course a CCX key was derived from; identity for plain keys.
    /// Course roles are granted on the master course.
    pub fn to_course_locator(&self) -> CourseKey {
        CourseKey {
            ccx: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ccx {
            Some(n) => write!(f, "ccx-v1:{}+{}+{}+ccx@{n}", self.org, self.course, self.run),
            None if self.deprecated => write!(f, "{}/{}/{}", self.org, self.course, self.run),
            None => write!(f, "course-v1:{}+{}+{}", self.org, self.course, self.run),
        }
    }
}

impl FromStr for CourseKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for CourseKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Anything that can name a course: a structured key or its string form.
pub trait IntoCourseKey {
    fn into_course_key(self) -> Result<CourseKey>;
}

impl IntoCourseKey for CourseKey {
    fn into_course_key(self) -> Result<CourseKey> {
        Ok(self)
    }
}

impl IntoCourseKey for &CourseKey {
    fn into_course_key(self) -> Result<CourseKey> {
        Ok(self.clone())
    }
}

impl IntoCourseKey for &str {
    fn into_course_key(self) -> Result<CourseKey> {
        CourseKey::parse(self)
    }
}

impl IntoCourseKey for String {
    fn into_course_key(self) -> Result<CourseKey> {
        CourseKey::parse(&self)
    }
}

impl IntoCourseKey for &String {
    fn into_course_key(self) -> Result<CourseKey> {
        CourseKey::parse(self)
    }
}
