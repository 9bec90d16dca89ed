//! Named anatomical reference points used to make spoken guidance specific.

use crate::pose::{midpoint, KeypointKind::*, Skeleton};
use opencv::core::Point2f;
use std::{collections::BTreeMap, fmt};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Site {
    /// CPR compression point, between the shoulders.
    SternumCpr,
    /// Epinephrine auto-injector site, halfway down the left thigh.
    LeftOuterThighEpipen,
    RightOuterThighEpipen,
    /// Carotid pulse check, between ear and shoulder.
    LeftNeckPulse,
    RightNeckPulse,
    /// AED pad placement, halfway between sternum and hips.
    ChestCenterAed,
}

impl Site {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::SternumCpr => "sternum_cpr",
            Self::LeftOuterThighEpipen => "left_outer_thigh_epipen",
            Self::RightOuterThighEpipen => "right_outer_thigh_epipen",
            Self::LeftNeckPulse => "left_neck_pulse",
            Self::RightNeckPulse => "right_neck_pulse",
            Self::ChestCenterAed => "chest_center_aed",
        }
    }

    /// The site kind without its side, used for labels and colors.
    pub(crate) fn kind(self) -> &'static str {
        match self {
            Self::SternumCpr => "sternum_cpr",
            Self::LeftOuterThighEpipen | Self::RightOuterThighEpipen => "outer_thigh_epipen",
            Self::LeftNeckPulse | Self::RightNeckPulse => "neck_pulse",
            Self::ChestCenterAed => "chest_center_aed",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) type Sites = BTreeMap<Site, Point2f>;

/// A site located on a specific person in the frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct PersonSite {
    pub(crate) person: usize,
    pub(crate) site: Site,
    pub(crate) point: Point2f,
}

impl PersonSite {
    /// Frame-level key, e.g. `Person 1_sternum_cpr`.
    pub(crate) fn key(&self) -> String {
        format!("Person {}_{}", self.person, self.site)
    }
}

/// Frame-level site map, ordered by person then site.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SiteMap(Vec<PersonSite>);

impl SiteMap {
    pub(crate) fn extend_person(&mut self, person: usize, sites: Sites) {
        self.0.extend(
            sites
                .into_iter()
                .map(|(site, point)| PersonSite {
                    person,
                    site,
                    point,
                }),
        );
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PersonSite> {
        self.0.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &str) -> Option<Point2f> {
        self.0
            .iter()
            .find(|site| site.key() == key)
            .map(|site| site.point)
    }
}

/// Derive every site whose source keypoints are all visible. Missing inputs omit the site.
pub(crate) fn map_sites(skeleton: &Skeleton) -> Sites {
    let mut sites = Sites::new();

    let sternum = skeleton.midpoint(LeftShoulder, RightShoulder);
    if let Some(sternum) = sternum {
        sites.insert(Site::SternumCpr, sternum);
    }

    let pairs = [
        (Site::LeftOuterThighEpipen, LeftHip, LeftKnee),
        (Site::RightOuterThighEpipen, RightHip, RightKnee),
        (Site::LeftNeckPulse, LeftEar, LeftShoulder),
        (Site::RightNeckPulse, RightEar, RightShoulder),
    ];
    for &(site, a, b) in &pairs {
        if let Some(point) = skeleton.midpoint(a, b) {
            sites.insert(site, point);
        }
    }

    if let (Some(sternum), Some(mid_hip)) = (sternum, skeleton.midpoint(LeftHip, RightHip)) {
        sites.insert(Site::ChestCenterAed, midpoint(sternum, mid_hip));
    }

    sites
}
