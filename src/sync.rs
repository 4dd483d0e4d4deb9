use chrono::NaiveDateTime;

use crate::auth::IdentityProvider;
use crate::config::Config;
use crate::error::SyncError;
use crate::graph::{
    Calendar, DateTimeTimeZone, Event, EventPayload, GraphClient, ItemBody, Page, TaskList,
    TodoTask,
};

/// Marker written into every event body; reconciliation matches on it so
/// hand-made events with the same subject are left alone.
pub const EVENT_MARKER: &str = "Microsoft To Do Reminder";

/// Extra pages fetched while looking for the list or calendar before
/// giving up.
const LOCATE_PAGE_RETRIES: usize = 5;

#[derive(Default, Debug)]
pub struct SyncReport {
    pub events_created: usize,
    pub events_updated: usize,
    pub in_sync: usize,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Events +{} ~{} | In sync {}",
            self.events_created, self.events_updated, self.in_sync
        )
    }
}

#[derive(Debug, Clone)]
pub enum SyncAction {
    Create(EventPayload),
    Update { event_id: String, payload: EventPayload },
}

/// Scans the first page, then up to `LOCATE_PAGE_RETRIES` continuations,
/// for the first matching row. Ends early on a match or when the
/// continuation link disappears.
fn locate<T>(
    first: Page<T>,
    mut fetch_next: impl FnMut(&str) -> Result<Page<T>, SyncError>,
    mut is_match: impl FnMut(&T) -> bool,
) -> Result<Option<T>, SyncError> {
    let mut page = first;
    for attempt in 0..=LOCATE_PAGE_RETRIES {
        if let Some(found) = page.value.into_iter().find(&mut is_match) {
            return Ok(Some(found));
        }
        if attempt == LOCATE_PAGE_RETRIES {
            break;
        }
        match page.next_link.as_deref() {
            Some(link) => page = fetch_next(link)?,
            None => break,
        }
    }
    Ok(None)
}

/// Accumulates `keep`-filtered rows from the first page plus up to
/// `look_back` continuation pages. Unlike `locate` this never stops on a
/// match; the goal is a complete snapshot of the window.
fn collect_pages<T, U>(
    first: Page<T>,
    look_back: i64,
    mut fetch_next: impl FnMut(&str) -> Result<Page<T>, SyncError>,
    mut keep: impl FnMut(T) -> Option<U>,
) -> Result<Vec<U>, SyncError> {
    let mut out: Vec<U> = first.value.into_iter().filter_map(&mut keep).collect();
    let mut next_link = first.next_link;
    for _ in 0..look_back.max(0) {
        let Some(link) = next_link else { break };
        let page = fetch_next(&link)?;
        out.extend(page.value.into_iter().filter_map(&mut keep));
        next_link = page.next_link;
    }
    Ok(out)
}

/// A task is synced iff its reminder is explicitly on, it is not completed
/// and it has a reminder time to anchor the event.
pub fn eligible(task: &TodoTask) -> bool {
    task.is_reminder_on == Some(true)
        && task.completed_date_time.is_none()
        && task.reminder_date_time.is_some()
}

fn candidate_for(task: &TodoTask) -> Option<EventPayload> {
    let reminder = task.reminder_date_time.clone()?;
    Some(EventPayload {
        subject: task.title.clone().unwrap_or_default(),
        body: ItemBody {
            content_type: Some("text".to_string()),
            content: Some(EVENT_MARKER.to_string()),
        },
        start: reminder.clone(),
        end: reminder,
        // The reminder already fired as a task; the event must not fire again.
        is_reminder_on: false,
    })
}

fn body_contains_marker(event: &Event) -> bool {
    event
        .body
        .as_ref()
        .and_then(|body| body.content.as_deref())
        .is_some_and(|content| content.contains(EVENT_MARKER))
}

fn parse_graph_datetime(value: &DateTimeTimeZone) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// Graph reports event times with fractional seconds while reminder times
/// may omit them; compare parsed values and fall back to the raw strings.
fn starts_equal(a: &DateTimeTimeZone, b: &DateTimeTimeZone) -> bool {
    match (parse_graph_datetime(a), parse_graph_datetime(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a.date_time == b.date_time,
    }
}

/// Pure reconciliation: decides per task whether the calendar needs a new
/// event, an overwrite, or nothing. Matching is exact subject equality plus
/// marker containment in the body; the first matching event in page order
/// wins when several qualify.
pub fn plan(tasks: &[TodoTask], events: &[Event]) -> Vec<SyncAction> {
    let mut actions = Vec::new();
    for task in tasks {
        let Some(candidate) = candidate_for(task) else {
            continue;
        };
        let existing = events.iter().find(|event| {
            event.subject.as_deref() == Some(candidate.subject.as_str())
                && body_contains_marker(event)
        });
        match existing {
            None => actions.push(SyncAction::Create(candidate)),
            Some(event) => {
                let unchanged = event
                    .start
                    .as_ref()
                    .is_some_and(|start| starts_equal(start, &candidate.start));
                if !unchanged {
                    actions.push(SyncAction::Update {
                        event_id: event.id.clone(),
                        payload: candidate,
                    });
                }
            }
        }
    }
    actions
}

pub struct SyncEngine<'a, P: IdentityProvider> {
    graph: &'a GraphClient<P>,
    config: &'a Config,
}

impl<'a, P: IdentityProvider> SyncEngine<'a, P> {
    pub fn new(graph: &'a GraphClient<P>, config: &'a Config) -> Self {
        Self { graph, config }
    }

    pub fn run(&self) -> Result<SyncReport, SyncError> {
        let user = self.graph.me()?;
        if let Some(name) = user.display_name.as_deref() {
            println!("{name}");
        }

        let list = self.find_list()?;
        println!("Found list \"{}\"", list.display_name);
        let tasks = self.collect_tasks(&list)?;
        for task in &tasks {
            println!("Task: {}", task.title.as_deref().unwrap_or("(untitled)"));
        }

        let calendar = self.find_calendar()?;
        println!("Found calendar \"{}\"", calendar.name);
        let events = self.collect_events(&calendar)?;

        let actions = plan(&tasks, &events);
        let mut report = SyncReport {
            in_sync: tasks.len() - actions.len(),
            ..SyncReport::default()
        };
        self.apply(&calendar, actions, &mut report)?;
        Ok(report)
    }

    fn find_list(&self) -> Result<TaskList, SyncError> {
        let name = self.config.list_name.as_str();
        let first = self.graph.list_task_lists()?;
        locate(
            first,
            |link| self.graph.fetch_page(link),
            |list: &TaskList| list.display_name == name,
        )?
        .ok_or_else(|| SyncError::NotFound(format!("Could not find list \"{name}\"")))
    }

    fn find_calendar(&self) -> Result<Calendar, SyncError> {
        let name = self.config.calendar_name.as_str();
        let first = self.graph.list_calendars()?;
        locate(
            first,
            |link| self.graph.fetch_page(link),
            |calendar: &Calendar| calendar.name == name,
        )?
        .ok_or_else(|| SyncError::NotFound(format!("Could not find calendar \"{name}\"")))
    }

    fn collect_tasks(&self, list: &TaskList) -> Result<Vec<TodoTask>, SyncError> {
        let first = self.graph.list_tasks(&list.id)?;
        collect_pages(
            first,
            self.config.look_back_pages,
            |link| self.graph.fetch_page(link),
            |task| if eligible(&task) { Some(task) } else { None },
        )
    }

    fn collect_events(&self, calendar: &Calendar) -> Result<Vec<Event>, SyncError> {
        let first = self.graph.list_events(&calendar.id)?;
        collect_pages(
            first,
            self.config.look_back_pages,
            |link| self.graph.fetch_page(link),
            Some,
        )
    }

    fn apply(
        &self,
        calendar: &Calendar,
        actions: Vec<SyncAction>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        for action in actions {
            match action {
                SyncAction::Create(payload) => {
                    self.graph.create_event(&calendar.id, &payload)?;
                    println!("Created event: {}", payload.subject);
                    report.events_created += 1;
                }
                SyncAction::Update { event_id, payload } => {
                    self.graph.update_event(&event_id, &payload)?;
                    println!("Updated event: {}", payload.subject);
                    report.events_updated += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page<T>(value: Vec<T>, next_link: Option<&str>) -> Page<T> {
        Page {
            value,
            next_link: next_link.map(str::to_string),
        }
    }

    fn task(title: &str, reminder: Option<&str>) -> TodoTask {
        TodoTask {
            id: format!("task-{title}"),
            title: Some(title.to_string()),
            is_reminder_on: Some(true),
            completed_date_time: None,
            reminder_date_time: reminder.map(DateTimeTimeZone::utc),
        }
    }

    fn marker_event(id: &str, subject: &str, start: &str) -> Event {
        Event {
            id: id.to_string(),
            subject: Some(subject.to_string()),
            body: Some(ItemBody {
                content_type: Some("text".to_string()),
                content: Some(format!("{EVENT_MARKER}\r\n")),
            }),
            start: Some(DateTimeTimeZone::utc(start)),
            end: Some(DateTimeTimeZone::utc(start)),
            is_reminder_on: Some(false),
        }
    }

    #[test]
    fn eligible_requires_flag_on_not_completed_and_a_reminder_time() {
        let good = task("Buy milk", Some("2024-05-01T09:00:00"));
        assert!(eligible(&good));

        let mut flag_off = good.clone();
        flag_off.is_reminder_on = Some(false);
        assert!(!eligible(&flag_off));

        let mut flag_unset = good.clone();
        flag_unset.is_reminder_on = None;
        assert!(!eligible(&flag_unset));

        let mut completed = good.clone();
        completed.completed_date_time = Some(DateTimeTimeZone::utc("2024-05-01T10:00:00"));
        assert!(!eligible(&completed));

        let mut no_time = good.clone();
        no_time.reminder_date_time = None;
        assert!(!eligible(&no_time));
    }

    #[test]
    fn locate_finds_a_match_on_a_later_page() {
        let first = page(vec![task("a", None)], Some("page2"));
        let mut fetches = 0;
        let found = locate(
            first,
            |link| {
                fetches += 1;
                assert_eq!(link, "page2");
                Ok(page(vec![task("b", None)], None))
            },
            |t: &TodoTask| t.title.as_deref() == Some("b"),
        )
        .expect("locate");
        assert_eq!(found.unwrap().title.as_deref(), Some("b"));
        assert_eq!(fetches, 1);
    }

    #[test]
    fn locate_gives_up_after_five_continuation_fetches() {
        let first = page(vec![task("nope", None)], Some("more"));
        let mut fetches = 0;
        let found = locate(
            first,
            |_| {
                fetches += 1;
                Ok(page(vec![task("nope", None)], Some("more")))
            },
            |t: &TodoTask| t.title.as_deref() == Some("missing"),
        )
        .expect("locate");
        assert!(found.is_none());
        assert_eq!(fetches, 5);
    }

    #[test]
    fn locate_stops_when_the_continuation_disappears() {
        let first = page(vec![task("only", None)], None);
        let mut fetches = 0;
        let found = locate(
            first,
            |_| {
                fetches += 1;
                Ok(page(Vec::new(), None))
            },
            |t: &TodoTask| t.title.as_deref() == Some("missing"),
        )
        .expect("locate");
        assert!(found.is_none());
        assert_eq!(fetches, 0);
    }

    #[test]
    fn locate_does_not_fetch_when_the_first_page_matches() {
        let first = page(vec![task("hit", None)], Some("more"));
        let found = locate(
            first,
            |_| panic!("should not fetch"),
            |t: &TodoTask| t.title.as_deref() == Some("hit"),
        )
        .expect("locate");
        assert!(found.is_some());
    }

    #[test]
    fn collect_pages_unions_filtered_rows_across_the_window() {
        let first = page(vec![1, 2], Some("p2"));
        let mut remaining = vec![page(vec![3, 4], Some("p3")), page(vec![5, 6], None)];
        let collected = collect_pages(
            first,
            10,
            |_| Ok(remaining.remove(0)),
            |n| if n % 2 == 0 { Some(n) } else { None },
        )
        .expect("collect");
        assert_eq!(collected, vec![2, 4, 6]);
    }

    #[test]
    fn collect_pages_respects_the_look_back_limit() {
        let first = page(vec![0], Some("more"));
        let mut fetches = 0;
        let collected = collect_pages(
            first,
            3,
            |_| {
                fetches += 1;
                Ok(page(vec![fetches], Some("more")))
            },
            Some,
        )
        .expect("collect");
        assert_eq!(fetches, 3);
        assert_eq!(collected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn collect_pages_clamps_a_negative_look_back() {
        let first = page(vec![7], Some("more"));
        let collected = collect_pages(first, -1, |_| panic!("should not fetch"), Some)
            .expect("collect");
        assert_eq!(collected, vec![7]);
    }

    #[test]
    fn plan_creates_when_no_event_matches() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T09:00:00"))];
        let actions = plan(&tasks, &[]);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            SyncAction::Create(payload) => {
                assert_eq!(payload.subject, "Buy milk");
                assert_eq!(payload.start, payload.end);
                assert!(!payload.is_reminder_on);
                assert_eq!(payload.body.content.as_deref(), Some(EVENT_MARKER));
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn plan_is_a_noop_when_subject_and_start_already_match() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T09:00:00"))];
        let events = vec![marker_event("e1", "Buy milk", "2024-05-01T09:00:00.0000000")];
        assert!(plan(&tasks, &events).is_empty());
    }

    #[test]
    fn plan_updates_when_the_reminder_moved() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T10:00:00"))];
        let events = vec![marker_event("e1", "Buy milk", "2024-05-01T09:00:00.0000000")];
        let actions = plan(&tasks, &events);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            SyncAction::Update { event_id, payload } => {
                assert_eq!(event_id, "e1");
                assert_eq!(payload.start.date_time, "2024-05-01T10:00:00");
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn plan_ignores_events_without_the_marker() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T09:00:00"))];
        let mut event = marker_event("e1", "Buy milk", "2024-05-01T09:00:00");
        event.body = Some(ItemBody {
            content_type: Some("text".to_string()),
            content: Some("a note the user wrote".to_string()),
        });
        let actions = plan(&tasks, &[event]);
        assert!(matches!(actions[0], SyncAction::Create(_)));
    }

    #[test]
    fn plan_requires_exact_subject_equality() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T09:00:00"))];
        let events = vec![marker_event("e1", "Buy milk!", "2024-05-01T09:00:00")];
        let actions = plan(&tasks, &events);
        assert!(matches!(actions[0], SyncAction::Create(_)));
    }

    #[test]
    fn plan_takes_the_first_match_in_page_order() {
        let tasks = vec![task("Buy milk", Some("2024-05-01T10:00:00"))];
        let events = vec![
            marker_event("first", "Buy milk", "2024-05-01T09:00:00"),
            marker_event("second", "Buy milk", "2024-05-01T08:00:00"),
        ];
        match &plan(&tasks, &events)[0] {
            SyncAction::Update { event_id, .. } => assert_eq!(event_id, "first"),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn plan_is_idempotent_after_applying_its_own_actions() {
        let tasks = vec![
            task("Buy milk", Some("2024-05-01T09:00:00")),
            task("Call dentist", Some("2024-05-02T14:30:00")),
        ];
        let mut events = vec![marker_event("e1", "Buy milk", "2024-04-30T09:00:00")];

        for (i, action) in plan(&tasks, &events).into_iter().enumerate() {
            match action {
                SyncAction::Create(payload) => events.push(Event {
                    id: format!("new-{i}"),
                    subject: Some(payload.subject),
                    body: Some(payload.body),
                    start: Some(payload.start),
                    end: Some(payload.end),
                    is_reminder_on: Some(payload.is_reminder_on),
                }),
                SyncAction::Update { event_id, payload } => {
                    let event = events
                        .iter_mut()
                        .find(|e| e.id == event_id)
                        .expect("updated event exists");
                    event.subject = Some(payload.subject);
                    event.body = Some(payload.body);
                    event.start = Some(payload.start);
                    event.end = Some(payload.end);
                }
            }
        }

        assert!(plan(&tasks, &events).is_empty());
    }

    #[test]
    fn starts_compare_across_fractional_seconds() {
        assert!(starts_equal(
            &DateTimeTimeZone::utc("2024-05-01T09:00:00"),
            &DateTimeTimeZone::utc("2024-05-01T09:00:00.0000000"),
        ));
        assert!(!starts_equal(
            &DateTimeTimeZone::utc("2024-05-01T09:00:00"),
            &DateTimeTimeZone::utc("2024-05-01T09:00:01"),
        ));
    }
}
