use iocraft::prelude::*;
use tokio::sync::watch;

const BAR_WIDTH: usize = 40;

#[derive(Default, Props)]
pub struct ProgressBarProps {
    pub title: String,
    /// Percentage in `[0, 100]`.
    pub progress: Option<watch::Receiver<f32>>,
}

#[component]
pub fn ProgressBar(props: &ProgressBarProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut percent = hooks.use_state(|| 0.0f32);
    let progress = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut progress) = progress else {
            return;
        };
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            percent.set(value.clamp(0.0, 100.0));
        }
    });

    let current = percent.get();
    let filled = ((current / 100.0) * BAR_WIDTH as f32).round() as usize;
    let bar = format!(
        "{}{}",
        "█".repeat(filled.min(BAR_WIDTH)),
        "░".repeat(BAR_WIDTH - filled.min(BAR_WIDTH))
    );

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(content: &props.title, weight: Weight::Bold)
            View(flex_direction: FlexDirection::Row) {
                Text(content: bar, color: Color::Green)
                Text(content: format!(" {:>5.1}%", current))
            }
        }
    }
}

#[derive(Default, Props)]
pub struct MessageProps {
    pub message: String,
}

#[component]
pub fn ErrorMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(content: "✗ ", color: Color::Red, weight: Weight::Bold)
            Text(content: &props.message, color: Color::Red)
        }
    }
}

#[component]
pub fn SuccessMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(content: "✓ ", color: Color::Green, weight: Weight::Bold)
            Text(content: &props.message)
        }
    }
}

#[derive(Default, Props)]
pub struct InputPromptProps {
    pub prompt: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

#[component]
pub fn InputPrompt(props: &InputPromptProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(content: &props.prompt, weight: Weight::Bold)
                #(props.default.as_ref().map(|default| element! {
                    Text(content: format!(" [{}]", default), color: Color::DarkGrey)
                }))
            }
            #(props.description.as_ref().map(|description| element! {
                Text(content: description, color: Color::DarkGrey)
            }))
        }
    }
}

#[component]
pub fn ConfigHeader() -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            View(background_color: Color::Blue) {
                Text(content: " rupload configuration ", color: Color::White, weight: Weight::Bold)
            }
            Text(content: "Press enter to keep the value in brackets.")
        }
    }
}

#[derive(Default, Props)]
pub struct SessionStatusProps {
    pub session: String,
    pub received: u64,
    pub total: Option<u64>,
}

#[component]
pub fn SessionStatus(props: &SessionStatusProps) -> impl Into<AnyElement<'static>> {
    let received = match props.total {
        Some(total) if total > 0 => format!(
            "{} / {} bytes ({:.1}%)",
            props.received,
            total,
            props.received as f64 / total as f64 * 100.0
        ),
        Some(total) => format!("{} / {} bytes", props.received, total),
        None => format!("{} bytes", props.received),
    };

    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(content: "┌ ")
                Text(content: &props.session, weight: Weight::Bold)
            }
            View(flex_direction: FlexDirection::Row) {
                Text(content: "└ received ")
                Text(content: received)
            }
        }
    }
}
