use ulid::Ulid;

use crate::model::*;

// ── Overlap classification ────────────────────────────────────────

/// How a target span sits relative to another span. Flags are computed
/// independently and are not mutually exclusive: equal spans both contain
/// and are contained by each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlapResult {
    /// Target starts inside `other` and runs past its end.
    pub start_within: bool,
    /// Target starts before `other` and ends inside it, short of its end.
    pub end_within: bool,
    /// Target encloses `other`.
    pub contains: bool,
    /// Target lies inside `other`.
    pub contained: bool,
}

impl OverlapResult {
    pub fn any(&self) -> bool {
        self.start_within || self.end_within || self.contains || self.contained
    }
}

/// Classify `target` against `other`. Spans are closed, so touching
/// endpoints count as overlap.
pub fn classify(target: &Span, other: &Span) -> OverlapResult {
    let starts_before = target.start <= other.start;
    let ends_before = target.end < other.end;
    let starts_during = !starts_before && target.start <= other.end;
    let ends_during = ends_before && target.end >= other.start;

    OverlapResult {
        start_within: starts_during && target.end > other.end,
        end_within: target.start < other.start && ends_during,
        contains: starts_before && !ends_before,
        contained: target.start >= other.start && target.end <= other.end,
    }
}

/// True if any classification flag is set.
pub fn overlaps(target: &Span, other: &Span) -> bool {
    classify(target, other).any()
}

// ── Listing admission ─────────────────────────────────────────────

/// Outcome of reconciling a candidate listing against its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPlan {
    /// The candidate after trimming.
    pub span: Span,
    /// Sibling listings the candidate encloses; they are deleted on commit.
    pub superseded: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The candidate lies inside an existing listing.
    ContainedBy(Ulid),
    /// Trimming left nothing of the candidate.
    TrimmedAway,
}

/// Trim `target` against `siblings` (visited in the given order, which the
/// engine keeps sorted by start). Each sibling sees the target as trimmed by
/// the ones before it. Nothing is mutated; the caller commits the plan.
pub fn make_viable(target: Span, siblings: &[Listing]) -> Result<ListingPlan, Rejection> {
    let mut span = target;
    let mut superseded = Vec::new();

    for old in siblings {
        let flags = classify(&span, &old.span);
        if flags.start_within {
            span.start = old.span.end;
        }
        if flags.end_within {
            span.end = old.span.start;
        }
        if flags.contains {
            superseded.push(old.id);
        }
        if flags.contained {
            return Err(Rejection::ContainedBy(old.id));
        }
    }

    if span.start > span.end {
        return Err(Rejection::TrimmedAway);
    }
    Ok(ListingPlan { span, superseded })
}

// ── Rental admission ──────────────────────────────────────────────

/// A rental is bookable when some listing contains it and no existing
/// rental overlaps it. One overlapping rental vetoes any number of matches.
pub fn is_viable(target: &Span, listings: &[Listing], rentals: &[Rental]) -> bool {
    let listed = listings
        .iter()
        .any(|l| classify(target, &l.span).contained);
    listed && !rentals.iter().any(|r| overlaps(target, &r.span))
}

/// Listing windows with rented days cut out. Rentals are closed, so the
/// pieces stop one ms short of each rental. `rentals` must be sorted by start.
/// A rental span is viable exactly when it fits inside one of the pieces.
pub fn free_windows(listings: &[Listing], rentals: &[Rental]) -> Vec<Span> {
    let mut result = Vec::new();
    for l in listings {
        let mut cursor = l.span.start;
        let mut open = true;
        for r in rentals {
            if r.span.end < cursor {
                continue;
            }
            if r.span.start > l.span.end {
                break;
            }
            if r.span.start > cursor {
                result.push(Span { start: cursor, end: r.span.start - 1 });
            }
            if r.span.end >= l.span.end {
                open = false;
                break;
            }
            cursor = r.span.end + 1;
        }
        if open {
            result.push(Span { start: cursor, end: l.span.end });
        }
    }
    result
}
